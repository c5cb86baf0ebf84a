//! NetworkManager D-Bus 客户端
//!
//! 通过 D-Bus 直接与 NetworkManager 守护进程通信：扫描周边接入点、
//! 在指定信道上创建 WPA2 热点，以及在配网端加入该热点。
//!
//! # 使用
//!
//! ```ignore
//! use bullsi_core::wifi::nm_dbus::NmClient;
//!
//! let client = NmClient::new().await?;
//! let device = client.find_wifi_device(Some("wlan0")).await?.unwrap();
//!
//! // 创建信道 6 上的热点
//! let conn = client.create_hotspot("x7Qp2z", "Ab3dEf9h", 6, "wlan0").await?;
//! client.activate_connection(&conn.as_ref(), &device).await?;
//! ```

use std::collections::HashMap;
use std::ops::Deref;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use zbus::Connection;
use zbus::proxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

/// NetworkManager 主接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    /// 获取所有网络设备
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    /// 激活连接
    fn activate_connection(
        &self,
        connection: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
        specific_object: &ObjectPath<'_>,
    ) -> zbus::Result<OwnedObjectPath>;

    /// NetworkManager 版本
    #[zbus(property)]
    fn version(&self) -> zbus::Result<String>;
}

/// NetworkManager.Settings 接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager/Settings"
)]
trait NmSettings {
    /// 添加新连接
    fn add_connection(
        &self,
        connection: HashMap<&str, HashMap<&str, Value<'_>>>,
    ) -> zbus::Result<OwnedObjectPath>;

    /// 列出所有连接
    fn list_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

/// NetworkManager.Settings.Connection 接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings.Connection",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmConnection {
    /// 获取连接设置
    fn get_settings(&self) -> zbus::Result<HashMap<String, HashMap<String, OwnedValue>>>;

    /// 删除连接
    fn delete(&self) -> zbus::Result<()>;
}

/// NetworkManager.Device 接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager.Device",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmDevice {
    /// 设备接口名 (如 wlan0)
    #[zbus(property)]
    fn interface(&self) -> zbus::Result<String>;

    /// 设备类型 (2=WiFi)
    #[zbus(property)]
    fn device_type(&self) -> zbus::Result<u32>;

    /// 设备状态
    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    /// 硬件地址 (MAC)
    #[zbus(property)]
    fn hw_address(&self) -> zbus::Result<String>;
}

/// NetworkManager.Device.Wireless 接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager.Device.Wireless",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmDeviceWireless {
    /// 触发 WiFi 扫描
    fn request_scan(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<()>;

    /// 获取所有接入点
    fn get_all_access_points(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

/// NetworkManager.AccessPoint 接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager.AccessPoint",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmAccessPoint {
    #[zbus(property)]
    fn ssid(&self) -> zbus::Result<Vec<u8>>;

    /// 频率 (MHz)
    #[zbus(property)]
    fn frequency(&self) -> zbus::Result<u32>;

    /// 信号质量 (0-100)
    #[zbus(property)]
    fn strength(&self) -> zbus::Result<u8>;
}

/// NetworkManager.Connection.Active 接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager.Connection.Active",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmActiveConnection {
    /// 连接状态
    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    /// IP4 配置对象路径
    #[zbus(property)]
    fn ip4_config(&self) -> zbus::Result<OwnedObjectPath>;
}

/// NetworkManager.IP4Config 接口代理
#[proxy(
    interface = "org.freedesktop.NetworkManager.IP4Config",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmIp4Config {
    /// 地址数据 (新格式)
    #[zbus(property)]
    fn address_data(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;
}

// ============================================================================
// 高层封装
// ============================================================================

/// 设备类型常量
pub mod device_type {
    pub const WIFI: u32 = 2;
}

/// 设备状态常量
pub mod device_state {
    pub const ACTIVATED: u32 = 100;
}

/// 连接状态常量
pub mod active_connection_state {
    pub const UNKNOWN: u32 = 0;
    pub const ACTIVATING: u32 = 1;
    pub const ACTIVATED: u32 = 2;
    pub const DEACTIVATING: u32 = 3;
    pub const DEACTIVATED: u32 = 4;

    pub fn name(state: u32) -> &'static str {
        match state {
            UNKNOWN => "UNKNOWN",
            ACTIVATING => "ACTIVATING",
            ACTIVATED => "ACTIVATED",
            DEACTIVATING => "DEACTIVATING",
            DEACTIVATED => "DEACTIVATED",
            _ => "INVALID",
        }
    }
}

/// 设备热点连接的配置名
pub fn hotspot_connection_id(ssid: &str) -> String {
    format!("bullsi-ap-{ssid}")
}

/// 配网端加入热点的配置名
pub fn client_connection_id(ssid: &str) -> String {
    format!("bullsi-join-{ssid}")
}

/// WiFi 设备信息
#[derive(Debug, Clone)]
pub struct WifiDevice {
    /// D-Bus 对象路径
    pub path: OwnedObjectPath,
    /// 接口名 (如 wlan0)
    pub interface: String,
    /// MAC 地址
    pub hw_address: String,
    /// 是否已激活
    pub is_active: bool,
}

/// 扫描到的接入点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointInfo {
    pub ssid: String,
    /// 频率 (MHz)
    pub frequency: u32,
    /// 信号质量 (0-100)
    pub strength: u8,
}

/// NetworkManager D-Bus 客户端
pub struct NmClient {
    connection: Connection,
}

impl NmClient {
    /// 创建新的 NM D-Bus 客户端
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;

        // 验证 NetworkManager 是否可用
        let nm = NetworkManagerProxy::new(&connection).await?;
        let version = nm.version().await?;
        info!("Connected to NetworkManager {}", version);

        Ok(Self { connection })
    }

    /// 获取 NetworkManager 版本
    pub async fn version(&self) -> Result<String> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        nm.version().await.context("Failed to get NM version")
    }

    /// 获取所有 WiFi 设备
    pub async fn get_wifi_devices(&self) -> Result<Vec<WifiDevice>> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        let device_paths = nm.get_devices().await?;

        let mut wifi_devices = Vec::new();

        for path in device_paths {
            let device = NmDeviceProxy::builder(&self.connection)
                .path(&path)?
                .build()
                .await?;

            if device.device_type().await.unwrap_or(0) != device_type::WIFI {
                continue;
            }

            let interface = device.interface().await.unwrap_or_default();
            let hw_address = device.hw_address().await.unwrap_or_default();
            let state = device.state().await.unwrap_or(0);

            wifi_devices.push(WifiDevice {
                path,
                interface,
                hw_address,
                is_active: state == device_state::ACTIVATED,
            });
        }

        Ok(wifi_devices)
    }

    /// 查找 WiFi 设备，未指定接口时取第一个
    pub async fn find_wifi_device(&self, interface: Option<&str>) -> Result<Option<WifiDevice>> {
        let devices = self.get_wifi_devices().await?;

        Ok(match interface {
            Some(iface) => devices.into_iter().find(|d| d.interface == iface),
            None => devices.into_iter().next(),
        })
    }

    /// 触发 WiFi 扫描
    pub async fn request_wifi_scan(&self, device: &WifiDevice) -> Result<()> {
        let wireless = NmDeviceWirelessProxy::builder(&self.connection)
            .path(&device.path)?
            .build()
            .await?;

        wireless
            .request_scan(HashMap::new())
            .await
            .context("Failed to request WiFi scan")?;

        Ok(())
    }

    /// 列出设备当前可见的接入点
    pub async fn access_points(&self, device: &WifiDevice) -> Result<Vec<AccessPointInfo>> {
        let wireless = NmDeviceWirelessProxy::builder(&self.connection)
            .path(&device.path)?
            .build()
            .await?;

        let paths = wireless
            .get_all_access_points()
            .await
            .context("Failed to list access points")?;

        let mut access_points = Vec::with_capacity(paths.len());
        for path in paths {
            let ap = NmAccessPointProxy::builder(&self.connection)
                .path(&path)?
                .build()
                .await?;

            // 接入点可能在读取过程中消失
            let (Ok(frequency), Ok(strength)) = (ap.frequency().await, ap.strength().await) else {
                debug!("Access point {} vanished during scan", path.as_str());
                continue;
            };
            let ssid = ap
                .ssid()
                .await
                .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                .unwrap_or_default();

            access_points.push(AccessPointInfo {
                ssid,
                frequency,
                strength,
            });
        }

        debug!("{} access point(s) visible", access_points.len());
        Ok(access_points)
    }

    /// 创建 2.4GHz 热点连接配置
    pub async fn create_hotspot(
        &self,
        ssid: &str,
        password: &str,
        channel: u8,
        interface: &str,
    ) -> Result<OwnedObjectPath> {
        let settings = NmSettingsProxy::new(&self.connection).await?;

        let conn_id = hotspot_connection_id(ssid);
        let connection_settings =
            build_hotspot_settings(&conn_id, ssid, password, channel, interface);

        let conn_path = settings
            .add_connection(connection_settings)
            .await
            .context("Failed to create hotspot connection")?;

        info!("Created hotspot connection: {:?}", conn_path);
        Ok(conn_path)
    }

    /// 创建 WiFi 客户端连接配置
    pub async fn create_wifi_connection(
        &self,
        ssid: &str,
        password: &str,
        interface: Option<&str>,
    ) -> Result<OwnedObjectPath> {
        let settings = NmSettingsProxy::new(&self.connection).await?;

        let conn_id = client_connection_id(ssid);
        let connection_settings = build_client_settings(&conn_id, ssid, password, interface);

        let conn_path = settings
            .add_connection(connection_settings)
            .await
            .context("Failed to create WiFi connection")?;

        info!("Created WiFi connection: {:?}", conn_path);
        Ok(conn_path)
    }

    /// 激活连接
    pub async fn activate_connection(
        &self,
        connection_path: &ObjectPath<'_>,
        device: &WifiDevice,
    ) -> Result<OwnedObjectPath> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;

        let device_path = device.path.as_ref();
        let active_conn = nm
            .activate_connection(
                connection_path,
                &device_path,
                &ObjectPath::from_static_str_unchecked("/"),
            )
            .await
            .context("Failed to activate connection")?;

        info!("Activated connection: {:?}", active_conn);
        Ok(active_conn)
    }

    /// 删除连接（通过名称）
    pub async fn delete_connection_by_name(&self, name: &str) -> Result<bool> {
        let settings = NmSettingsProxy::new(&self.connection).await?;
        let connections = settings.list_connections().await?;

        for conn_path in connections {
            let conn = NmConnectionProxy::builder(&self.connection)
                .path(&conn_path)?
                .build()
                .await?;

            if let Ok(conn_settings) = conn.get_settings().await
                && let Some(connection_section) = conn_settings.get("connection")
                && let Some(id_value) = connection_section.get("id")
                && let Value::Str(id_str) = id_value.deref()
                && id_str.as_str() == name
            {
                conn.delete().await?;
                debug!("Deleted connection by name: {}", name);
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// 等待连接激活（不等待IP配置，适用于热点模式）
    pub async fn wait_for_activation(
        &self,
        active_connection: &ObjectPath<'_>,
        timeout: Duration,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        let mut last_state = 0u32;

        let active = NmActiveConnectionProxy::builder(&self.connection)
            .path(active_connection)?
            .build()
            .await?;

        loop {
            if start.elapsed() > timeout {
                return Err(anyhow::anyhow!(
                    "Timeout waiting for connection activation (last state: {})",
                    active_connection_state::name(last_state)
                ));
            }

            let state = active.state().await.unwrap_or(0);

            if state != last_state {
                debug!(
                    "Connection state changed: {} -> {}",
                    active_connection_state::name(last_state),
                    active_connection_state::name(state)
                );
                last_state = state;
            }

            match state {
                active_connection_state::ACTIVATED => {
                    info!("Connection activated successfully");
                    return Ok(());
                }
                active_connection_state::DEACTIVATED | active_connection_state::DEACTIVATING => {
                    return Err(anyhow::anyhow!(
                        "Connection failed to activate (state: {})",
                        active_connection_state::name(state)
                    ));
                }
                _ => {}
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// 等待连接激活并获取 IP
    pub async fn wait_for_ip(
        &self,
        active_connection: &ObjectPath<'_>,
        timeout: Duration,
    ) -> Result<String> {
        let start = std::time::Instant::now();

        let active = NmActiveConnectionProxy::builder(&self.connection)
            .path(active_connection)?
            .build()
            .await?;

        loop {
            if start.elapsed() > timeout {
                return Err(anyhow::anyhow!("Timeout waiting for IP address"));
            }

            if active.state().await.unwrap_or(0) == active_connection_state::ACTIVATED
                && let Ok(ip4_path) = active.ip4_config().await
                && ip4_path.as_str() != "/"
            {
                let ip4 = NmIp4ConfigProxy::builder(&self.connection)
                    .path(&ip4_path)?
                    .build()
                    .await?;

                if let Ok(addresses) = ip4.address_data().await {
                    for addr in addresses {
                        if let Some(address_value) = addr.get("address")
                            && let Value::Str(ip_str) = address_value.deref()
                        {
                            return Ok(ip_str.to_string());
                        }
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// 构建热点连接设置
fn build_hotspot_settings<'a>(
    conn_id: &'a str,
    ssid: &'a str,
    password: &'a str,
    channel: u8,
    interface: &'a str,
) -> HashMap<&'a str, HashMap<&'a str, Value<'a>>> {
    let mut settings: HashMap<&str, HashMap<&str, Value>> = HashMap::new();

    let mut connection: HashMap<&str, Value> = HashMap::new();
    connection.insert("id", Value::Str(conn_id.into()));
    connection.insert("type", Value::Str("802-11-wireless".into()));
    connection.insert("autoconnect", Value::Bool(false));
    connection.insert("interface-name", Value::Str(interface.into()));
    settings.insert("connection", connection);

    let mut wireless: HashMap<&str, Value> = HashMap::new();
    wireless.insert("ssid", Value::Array(ssid.as_bytes().into()));
    wireless.insert("mode", Value::Str("ap".into()));
    wireless.insert("band", Value::Str("bg".into()));
    wireless.insert("channel", Value::U32(u32::from(channel)));
    settings.insert("802-11-wireless", wireless);

    let mut wireless_security: HashMap<&str, Value> = HashMap::new();
    wireless_security.insert("key-mgmt", Value::Str("wpa-psk".into()));
    wireless_security.insert("psk", Value::Str(password.into()));
    settings.insert("802-11-wireless-security", wireless_security);

    // 共享模式，NM 为连入的客户端提供 DHCP
    let mut ipv4: HashMap<&str, Value> = HashMap::new();
    ipv4.insert("method", Value::Str("shared".into()));
    settings.insert("ipv4", ipv4);

    let mut ipv6: HashMap<&str, Value> = HashMap::new();
    ipv6.insert("method", Value::Str("ignore".into()));
    settings.insert("ipv6", ipv6);

    settings
}

/// 构建 WiFi 客户端连接设置
fn build_client_settings<'a>(
    conn_id: &'a str,
    ssid: &'a str,
    password: &'a str,
    interface: Option<&'a str>,
) -> HashMap<&'a str, HashMap<&'a str, Value<'a>>> {
    let mut settings: HashMap<&str, HashMap<&str, Value>> = HashMap::new();

    let mut connection: HashMap<&str, Value> = HashMap::new();
    connection.insert("id", Value::Str(conn_id.into()));
    connection.insert("type", Value::Str("802-11-wireless".into()));
    connection.insert("autoconnect", Value::Bool(false));
    if let Some(iface) = interface {
        connection.insert("interface-name", Value::Str(iface.into()));
    }
    settings.insert("connection", connection);

    let mut wireless: HashMap<&str, Value> = HashMap::new();
    wireless.insert("ssid", Value::Array(ssid.as_bytes().into()));
    wireless.insert("mode", Value::Str("infrastructure".into()));
    settings.insert("802-11-wireless", wireless);

    let mut wireless_security: HashMap<&str, Value> = HashMap::new();
    wireless_security.insert("key-mgmt", Value::Str("wpa-psk".into()));
    wireless_security.insert("psk", Value::Str(password.into()));
    settings.insert("802-11-wireless-security", wireless_security);

    let mut ipv4: HashMap<&str, Value> = HashMap::new();
    ipv4.insert("method", Value::Str("auto".into()));
    settings.insert("ipv4", ipv4);

    let mut ipv6: HashMap<&str, Value> = HashMap::new();
    ipv6.insert("method", Value::Str("auto".into()));
    settings.insert("ipv6", ipv6);

    settings
}
