//! WiFi 模块测试
//!
//! 包含扫描结果转换和热点启动流程的单元测试

use super::*;
use crate::channel::FALLBACK_CHANNEL;
use std::sync::Mutex as StdMutex;

// ============================================================================
// 频率与信号转换
// ============================================================================

#[test]
fn test_frequency_to_channel() {
    assert_eq!(frequency_to_channel(2412), Some(1));
    assert_eq!(frequency_to_channel(2437), Some(6));
    assert_eq!(frequency_to_channel(2462), Some(11));
    assert_eq!(frequency_to_channel(2484), Some(14));
    assert_eq!(frequency_to_channel(5180), Some(36));
    assert_eq!(frequency_to_channel(5745), Some(149));
    assert_eq!(frequency_to_channel(900), None);
}

#[test]
fn test_strength_to_dbm() {
    assert_eq!(strength_to_dbm(100), -40);
    assert_eq!(strength_to_dbm(50), -70);
    assert_eq!(strength_to_dbm(0), -100);
    // 超出范围按 100 处理
    assert_eq!(strength_to_dbm(250), -40);
}

#[test]
fn test_scan_records_drop_unknown_frequency() {
    let aps = [
        AccessPointInfo {
            ssid: "home".to_string(),
            frequency: 2437,
            strength: 100,
        },
        AccessPointInfo {
            ssid: "weird".to_string(),
            frequency: 60_000,
            strength: 80,
        },
    ];
    assert_eq!(scan_records(&aps), vec![ScanRecord::new(6, -40)]);
}

// ============================================================================
// 启动流程
// ============================================================================

struct FakeRadio {
    scan: Result<Vec<ScanRecord>, String>,
    fail_ap: bool,
    started: StdMutex<Vec<(String, String, u8)>>,
}

impl FakeRadio {
    fn new(scan: Result<Vec<ScanRecord>, String>) -> Self {
        Self {
            scan,
            fail_ap: false,
            started: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn scan(&self) -> Result<Vec<ScanRecord>, WifiError> {
        self.scan.clone().map_err(WifiError::ScanFailed)
    }

    async fn start_access_point(
        &self,
        network_name: &str,
        password: &str,
        channel: u8,
    ) -> Result<(), WifiError> {
        self.started.lock().unwrap().push((
            network_name.to_string(),
            password.to_string(),
            channel,
        ));
        if self.fail_ap {
            return Err(WifiError::AccessPoint("radio busy".to_string()));
        }
        Ok(())
    }

    async fn stop_access_point(&self) -> Result<(), WifiError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_bring_up_uses_quietest_channel() {
    let radio = FakeRadio::new(Ok(vec![ScanRecord::new(6, -40), ScanRecord::new(7, -80)]));

    let identity = bring_up(&radio, "x7Qp2z".to_string(), "Ab3dEf9h").await;
    assert_eq!(identity.channel, 1);
    assert_eq!(identity.network_name, "x7Qp2z");
    assert_eq!(
        radio.started.lock().unwrap().as_slice(),
        [("x7Qp2z".to_string(), "Ab3dEf9h".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_bring_up_failed_scan_falls_back() {
    let radio = FakeRadio::new(Err("device busy".to_string()));

    let identity = bring_up(&radio, "x7Qp2z".to_string(), "Ab3dEf9h").await;
    assert_eq!(identity.channel, FALLBACK_CHANNEL);
}

#[tokio::test]
async fn test_bring_up_survives_ap_failure() {
    let mut radio = FakeRadio::new(Ok(vec![]));
    radio.fail_ap = true;

    let identity = bring_up(&radio, "x7Qp2z".to_string(), "Ab3dEf9h").await;
    assert_eq!(identity.channel, FALLBACK_CHANNEL);
    assert_eq!(radio.started.lock().unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires system D-Bus and NetworkManager"]
async fn test_nm_radio_scan() {
    let radio = NmRadio::new("wlan0", Duration::from_secs(2));
    let records = radio.scan().await.unwrap();
    println!("Scan records: {:?}", records);
}
