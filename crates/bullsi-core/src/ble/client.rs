//! BLE Client - 配网端连接设备
//!
//! 流程:
//! 1. 扫描广播了控制服务的设备
//! 2. 连接并发现服务
//! 3. 读取 claim 获得密钥，之后用密钥调用 hold / 网络标识请求 / wipe

use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use log::{debug, info};
use tokio::time;
use uuid::Uuid;

use crate::ble::{Endpoint, SERVICE_UUID};

/// 设备查找时的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// BLE 客户端错误
#[derive(Debug, thiserror::Error)]
pub enum BleClientError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("No notification within {0:?} (secret rejected or lease expired?)")]
    NoResponse(Duration),

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),
}

/// 扫描到的设备
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// 按地址（忽略大小写）或名称匹配
    pub fn matches(&self, target: &str) -> bool {
        self.address.eq_ignore_ascii_case(target) || self.name == target
    }
}

pub struct BleClient {
    adapter: Adapter,
}

impl BleClient {
    pub async fn new() -> Result<Self, BleClientError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(BleClientError::NoAdapter)?;

        Ok(Self { adapter })
    }

    /// 扫描一段时间，返回广播了控制服务的设备
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, BleClientError> {
        self.start_scan().await?;
        time::sleep(timeout).await;
        let devices = self.visible_devices().await;
        self.adapter.stop_scan().await?;

        info!("Discovered {} device(s)", devices.as_ref().map_or(0, Vec::len));
        devices
    }

    /// 连接到设备（地址或名称）
    pub async fn connect(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<DeviceConnection, BleClientError> {
        let peripheral = self.find_device(target, timeout).await?;

        info!("Connecting to {}", target);
        peripheral.connect().await?;

        // 等待连接稳定
        time::sleep(Duration::from_millis(500)).await;

        debug!("Discovering services...");
        peripheral.discover_services().await?;

        Ok(DeviceConnection { peripheral })
    }

    async fn start_scan(&self) -> Result<(), BleClientError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await?;
        Ok(())
    }

    async fn visible_devices(&self) -> Result<Vec<DiscoveredDevice>, BleClientError> {
        Ok(self
            .visible_peripherals()
            .await?
            .into_iter()
            .map(|(_, device)| device)
            .collect())
    }

    async fn visible_peripherals(
        &self,
    ) -> Result<Vec<(PlatformPeripheral, DiscoveredDevice)>, BleClientError> {
        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            if !props.services.contains(&SERVICE_UUID) {
                continue;
            }
            let device = DiscoveredDevice {
                name: props.local_name.unwrap_or_default(),
                address: props.address.to_string(),
                rssi: props.rssi,
            };
            found.push((peripheral, device));
        }
        Ok(found)
    }

    async fn find_device(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<PlatformPeripheral, BleClientError> {
        self.start_scan().await?;
        let deadline = time::Instant::now() + timeout;

        let result = loop {
            let hit = self
                .visible_peripherals()
                .await?
                .into_iter()
                .find(|(_, device)| device.matches(target));
            if let Some((peripheral, device)) = hit {
                debug!("Found {} at {}", device.name, device.address);
                break Ok(peripheral);
            }
            if time::Instant::now() >= deadline {
                break Err(BleClientError::DeviceNotFound(target.to_string()));
            }
            time::sleep(POLL_INTERVAL).await;
        };

        self.adapter.stop_scan().await?;
        result
    }
}

/// 已连接的设备
pub struct DeviceConnection {
    peripheral: PlatformPeripheral,
}

impl DeviceConnection {
    fn characteristic(&self, endpoint: Endpoint) -> Result<Characteristic, BleClientError> {
        let uuid = endpoint.uuid();
        self.peripheral
            .services()
            .into_iter()
            .filter(|service| service.uuid == SERVICE_UUID)
            .flat_map(|service| service.characteristics)
            .find(|c| c.uuid == uuid)
            .ok_or(BleClientError::CharacteristicNotFound(uuid))
    }

    async fn read_string(&self, endpoint: Endpoint) -> Result<String, BleClientError> {
        let characteristic = self.characteristic(endpoint)?;
        let data = self.peripheral.read(&characteristic).await?;
        debug!("{} read {} bytes", endpoint.name(), data.len());
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    async fn write_secret(&self, endpoint: Endpoint, secret: &str) -> Result<(), BleClientError> {
        let characteristic = self.characteristic(endpoint)?;
        debug!("Writing {} ({} bytes)", endpoint.name(), secret.len());
        self.peripheral
            .write(&characteristic, secret.as_bytes(), WriteType::WithResponse)
            .await?;
        Ok(())
    }

    /// 读取当前密钥；设备租约已清除时为空
    pub async fn claim(&self) -> Result<String, BleClientError> {
        self.read_string(Endpoint::Claim).await
    }

    /// "claimed" 或 "unclaimed"
    pub async fn status(&self) -> Result<String, BleClientError> {
        self.read_string(Endpoint::Status).await
    }

    pub async fn hold(&self, secret: &str) -> Result<(), BleClientError> {
        self.write_secret(Endpoint::Hold, secret).await
    }

    pub async fn wipe(&self, secret: &str) -> Result<(), BleClientError> {
        self.write_secret(Endpoint::Wipe, secret).await
    }

    /// 订阅网络标识，发送请求并等待通知
    ///
    /// 密钥被拒绝时设备不会推送，表现为超时。
    pub async fn request_network_identity(
        &self,
        secret: &str,
        timeout: Duration,
    ) -> Result<String, BleClientError> {
        let identity = self.characteristic(Endpoint::NetworkIdentity)?;
        self.peripheral.subscribe(&identity).await?;
        let mut notifications = self.peripheral.notifications().await?;

        self.write_secret(Endpoint::NetworkIdentityRequest, secret)
            .await?;

        let wait = async {
            while let Some(n) = notifications.next().await {
                if n.uuid == identity.uuid {
                    return Some(String::from_utf8_lossy(&n.value).into_owned());
                }
            }
            None
        };
        let name = time::timeout(timeout, wait)
            .await
            .ok()
            .flatten()
            .ok_or(BleClientError::NoResponse(timeout))?;

        self.peripheral.unsubscribe(&identity).await?;
        info!("Received network identity '{}'", name);
        Ok(name)
    }

    pub async fn disconnect(&self) -> Result<(), BleClientError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
