pub mod client;
pub mod server;

use uuid::Uuid;

use crate::subscription::ValueId;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xa4951234_c5b1_4b44_b512_1370f02d74de);
pub const CLAIM_CHAR_UUID: Uuid = Uuid::from_u128(0xa4955678_c5b1_4b44_b512_1370f02d74d1);
pub const HOLD_CHAR_UUID: Uuid = Uuid::from_u128(0xa4955678_c5b1_4b44_b512_1370f02d74d2);
pub const NETWORK_IDENTITY_REQUEST_CHAR_UUID: Uuid =
    Uuid::from_u128(0xa4955678_c5b1_4b44_b512_1370f02d74d3);
pub const NETWORK_IDENTITY_CHAR_UUID: Uuid =
    Uuid::from_u128(0xa4955678_c5b1_4b44_b512_1370f02d74d4);
pub const WIPE_CHAR_UUID: Uuid = Uuid::from_u128(0xa4955678_c5b1_4b44_b512_1370f02d74d5);
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0xa4955678_c5b1_4b44_b512_1370f02d74d6);

/// 控制通道端点，每个端点对应一个 GATT 特征
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// 读：返回当前密钥
    Claim,
    /// 写：回传密钥以保持租约
    Hold,
    /// 写：回传密钥，成功后推送网络名称
    NetworkIdentityRequest,
    /// 读 / 通知：会话网络名称
    NetworkIdentity,
    /// 写：回传密钥以重置设备
    Wipe,
    /// 读 / 通知："claimed" 或 "unclaimed"
    Status,
}

impl Endpoint {
    pub const ALL: [Endpoint; 6] = [
        Endpoint::Claim,
        Endpoint::Hold,
        Endpoint::NetworkIdentityRequest,
        Endpoint::NetworkIdentity,
        Endpoint::Wipe,
        Endpoint::Status,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Endpoint::Claim => CLAIM_CHAR_UUID,
            Endpoint::Hold => HOLD_CHAR_UUID,
            Endpoint::NetworkIdentityRequest => NETWORK_IDENTITY_REQUEST_CHAR_UUID,
            Endpoint::NetworkIdentity => NETWORK_IDENTITY_CHAR_UUID,
            Endpoint::Wipe => WIPE_CHAR_UUID,
            Endpoint::Status => STATUS_CHAR_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.uuid() == uuid)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Claim => "claim",
            Endpoint::Hold => "hold",
            Endpoint::NetworkIdentityRequest => "network-identity-request",
            Endpoint::NetworkIdentity => "network-identity",
            Endpoint::Wipe => "wipe",
            Endpoint::Status => "status",
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            Endpoint::Claim | Endpoint::NetworkIdentity | Endpoint::Status
        )
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            Endpoint::Hold | Endpoint::NetworkIdentityRequest | Endpoint::Wipe
        )
    }

    /// 可订阅端点对应的值
    pub fn value_id(&self) -> Option<ValueId> {
        match self {
            Endpoint::NetworkIdentity => Some(ValueId::NetworkIdentity),
            Endpoint::Status => Some(ValueId::Status),
            _ => None,
        }
    }
}

/// 解码写入的密钥
///
/// 部分客户端会在末尾附带 NUL 或换行，这里一并去掉；空格属于密钥本身。
pub fn decode_payload(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches(['\0', '\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uuid_roundtrip() {
        for endpoint in Endpoint::ALL {
            assert_eq!(Endpoint::from_uuid(endpoint.uuid()), Some(endpoint));
        }
        assert_eq!(Endpoint::from_uuid(SERVICE_UUID), None);
    }

    #[test]
    fn test_uuid_strings() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "a4951234-c5b1-4b44-b512-1370f02d74de"
        );
        assert_eq!(
            STATUS_CHAR_UUID.to_string(),
            "a4955678-c5b1-4b44-b512-1370f02d74d6"
        );
    }

    #[test]
    fn test_endpoint_access() {
        let readable: Vec<_> = Endpoint::ALL.iter().filter(|e| e.is_readable()).collect();
        let writable: Vec<_> = Endpoint::ALL.iter().filter(|e| e.is_writable()).collect();
        assert_eq!(readable.len(), 3);
        assert_eq!(writable.len(), 3);
        assert_eq!(Endpoint::Status.value_id(), Some(ValueId::Status));
        assert_eq!(Endpoint::Hold.value_id(), None);
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(b"Ab3dEf9h"), "Ab3dEf9h");
        assert_eq!(decode_payload(b"Ab3dEf9h\0\0"), "Ab3dEf9h");
        assert_eq!(decode_payload(b"Ab3dEf9h\r\n"), "Ab3dEf9h");
        // 空格属于密钥的一部分，不做处理
        assert_eq!(decode_payload(b" Ab3d"), " Ab3d");
        assert_eq!(decode_payload(b"Ab3dEf9h "), "Ab3dEf9h ");
        assert_eq!(decode_payload(b"Ab3dEf9h \n"), "Ab3dEf9h ");
        assert_eq!(decode_payload(b"Ab3dEf9h\t"), "Ab3dEf9h\t");
    }
}
