//! 无线电 - 扫描周边网络并在选定信道上启动设备热点
//!
//! 启动流程 ([`bring_up`])：
//!
//! 1. 扫描周边接入点，转换为 [`ScanRecord`]
//! 2. 由信道选择挑出干扰最小的信道（扫描失败时回退）
//! 3. 以会话网络名称和租约密钥启动热点
//!
//! 热点启动失败只记录日志，BLE 控制通道照常提供服务。

pub mod nm_dbus;

use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::channel::{ScanRecord, select_from_scan};
use crate::control::SessionIdentity;
use nm_dbus::{AccessPointInfo, NmClient, WifiDevice, hotspot_connection_id};

#[cfg(test)]
mod tests;

/// 无线电错误
#[derive(Debug, thiserror::Error)]
pub enum WifiError {
    #[error("NetworkManager unavailable: {0}")]
    Unavailable(String),

    #[error("WiFi device {0} not found")]
    DeviceNotFound(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Access point failed: {0}")]
    AccessPoint(String),
}

/// 无线电硬件
#[async_trait]
pub trait Radio: Send + Sync {
    /// 扫描周边网络
    async fn scan(&self) -> Result<Vec<ScanRecord>, WifiError>;

    /// 以 WPA2 启动热点
    async fn start_access_point(
        &self,
        network_name: &str,
        password: &str,
        channel: u8,
    ) -> Result<(), WifiError>;

    /// 停止热点
    async fn stop_access_point(&self) -> Result<(), WifiError>;
}

/// 频率 (MHz) 转换为信道编号
pub fn frequency_to_channel(frequency: u32) -> Option<u8> {
    let channel = match frequency {
        2484 => 14,
        2412..=2472 => (frequency - 2407) / 5,
        5000..=5900 => (frequency - 5000) / 5,
        _ => return None,
    };
    u8::try_from(channel).ok()
}

/// 信号质量 (0-100) 近似转换为 dBm
///
/// 0% 对应 -100dBm，100% 对应 -40dBm。
pub fn strength_to_dbm(strength: u8) -> i16 {
    let quality = i16::from(strength.min(100));
    -40 - (100 - quality) * 60 / 100
}

/// 将接入点列表转换为扫描记录，无法识别频率的接入点被丢弃
pub fn scan_records(access_points: &[AccessPointInfo]) -> Vec<ScanRecord> {
    access_points
        .iter()
        .filter_map(|ap| {
            let channel = frequency_to_channel(ap.frequency)?;
            Some(ScanRecord::new(channel, strength_to_dbm(ap.strength)))
        })
        .collect()
}

/// 扫描、选择信道并启动热点
pub async fn bring_up(radio: &dyn Radio, network_name: String, password: &str) -> SessionIdentity {
    let channel = select_from_scan(radio.scan().await);

    match radio
        .start_access_point(&network_name, password, channel)
        .await
    {
        Ok(()) => info!("Access point '{}' up on channel {}", network_name, channel),
        Err(e) => error!("Failed to start access point '{}': {}", network_name, e),
    }

    SessionIdentity {
        network_name,
        channel,
    }
}

/// 基于 NetworkManager 的无线电
pub struct NmRadio {
    interface: String,
    scan_settle: Duration,
    nm_client: Mutex<Option<NmClient>>,
    active_connection: Mutex<Option<String>>,
}

impl NmRadio {
    pub fn new(interface: impl Into<String>, scan_settle: Duration) -> Self {
        Self {
            interface: interface.into(),
            scan_settle,
            nm_client: Mutex::new(None),
            active_connection: Mutex::new(None),
        }
    }

    /// 初始化 NM 客户端
    async fn ensure_nm_client(&self) -> Result<(), WifiError> {
        let mut client = self.nm_client.lock().await;
        if client.is_none() {
            let c = NmClient::new()
                .await
                .map_err(|e| WifiError::Unavailable(e.to_string()))?;
            info!("NetworkManager D-Bus client initialized");
            *client = Some(c);
        }
        Ok(())
    }

    async fn device(&self, client: &NmClient) -> Result<WifiDevice, WifiError> {
        client
            .find_wifi_device(Some(&self.interface))
            .await
            .map_err(|e| WifiError::Unavailable(e.to_string()))?
            .ok_or_else(|| WifiError::DeviceNotFound(self.interface.clone()))
    }

    async fn start_access_point_nm(
        &self,
        network_name: &str,
        password: &str,
        channel: u8,
    ) -> anyhow::Result<()> {
        self.ensure_nm_client().await?;
        let client_guard = self.nm_client.lock().await;
        let client = client_guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("NM client not initialized"))?;

        // 先删除可能存在的旧连接
        let conn_name = hotspot_connection_id(network_name);
        let _ = client.delete_connection_by_name(&conn_name).await;

        let conn_path = client
            .create_hotspot(network_name, password, channel, &self.interface)
            .await?;
        let device = self.device(client).await?;
        let active = client
            .activate_connection(&conn_path.as_ref(), &device)
            .await?;
        client
            .wait_for_activation(&active.as_ref(), Duration::from_secs(15))
            .await?;

        *self.active_connection.lock().await = Some(conn_name);
        Ok(())
    }

    /// nmcli 备用方案
    async fn start_access_point_nmcli(
        &self,
        network_name: &str,
        password: &str,
        channel: u8,
    ) -> anyhow::Result<()> {
        let channel = channel.to_string();
        let output = Command::new("nmcli")
            .args([
                "device",
                "wifi",
                "hotspot",
                "ifname",
                &self.interface,
                "con-name",
                &hotspot_connection_id(network_name),
                "ssid",
                network_name,
                "password",
                password,
                "band",
                "bg",
                "channel",
                &channel,
            ])
            .output()?;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("nmcli hotspot failed: {}", err.trim()));
        }

        *self.active_connection.lock().await = Some(hotspot_connection_id(network_name));
        Ok(())
    }
}

#[async_trait]
impl Radio for NmRadio {
    async fn scan(&self) -> Result<Vec<ScanRecord>, WifiError> {
        self.ensure_nm_client().await?;
        let client_guard = self.nm_client.lock().await;
        let client = client_guard
            .as_ref()
            .ok_or_else(|| WifiError::Unavailable("NM client not initialized".to_string()))?;

        let device = self.device(client).await?;

        // 最近刚扫描过时 NM 会拒绝，此时直接使用缓存结果
        if let Err(e) = client.request_wifi_scan(&device).await {
            debug!("Scan request rejected ({}), using cached results", e);
        } else {
            tokio::time::sleep(self.scan_settle).await;
        }

        let access_points = client
            .access_points(&device)
            .await
            .map_err(|e| WifiError::ScanFailed(e.to_string()))?;
        let records = scan_records(&access_points);
        info!(
            "Scan on {} found {} network(s)",
            self.interface,
            records.len()
        );
        Ok(records)
    }

    async fn start_access_point(
        &self,
        network_name: &str,
        password: &str,
        channel: u8,
    ) -> Result<(), WifiError> {
        match self
            .start_access_point_nm(network_name, password, channel)
            .await
        {
            Ok(()) => {
                info!("Hotspot created via NetworkManager D-Bus");
                Ok(())
            }
            Err(e) => {
                warn!("NM D-Bus hotspot failed: {}, trying nmcli", e);
                self.start_access_point_nmcli(network_name, password, channel)
                    .await
                    .map_err(|cli_err| {
                        WifiError::AccessPoint(format!("NM={}, nmcli={}", e, cli_err))
                    })
            }
        }
    }

    async fn stop_access_point(&self) -> Result<(), WifiError> {
        let Some(conn_name) = self.active_connection.lock().await.take() else {
            return Ok(());
        };
        debug!("Stopping hotspot {}", conn_name);

        self.ensure_nm_client().await?;
        let client_guard = self.nm_client.lock().await;
        if let Some(client) = client_guard.as_ref() {
            client
                .delete_connection_by_name(&conn_name)
                .await
                .map_err(|e| WifiError::AccessPoint(e.to_string()))?;
        }
        Ok(())
    }
}
