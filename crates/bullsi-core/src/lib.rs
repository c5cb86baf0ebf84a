//! Bullsi Core Library
//!
//! 无头设备的 BLE 配网核心：租约授权、信道选择和订阅通知
//!
//! # 模块
//!
//! - **lease**: 独占访问租约的认领、保持与过期
//! - **channel**: 基于扫描结果的 2.4GHz 信道选择
//! - **subscription**: 每个值最多一个订阅者的通知登记
//! - **control**: 单线程控制循环，把以上部分串起来
//! - **ble**: GATT 服务端 (bluer) 与配网端客户端 (btleplug)
//! - **wifi**: NetworkManager 扫描与热点
//!
//! # 使用示例
//!
//! ```ignore
//! use bullsi_core::{ControlLoop, GattServer, LeaseManager, MonotonicClock, NmRadio};
//!
//! // 1. 生成租约，扫描并启动热点
//! let clock = MonotonicClock::new();
//! let lease = LeaseManager::generate(&mut rand::thread_rng(), clock.now_ms(), 3_000);
//! let radio = NmRadio::new("wlan0", Duration::from_secs(2));
//! let identity = wifi::bring_up(&radio, network_name, lease.secret()).await;
//!
//! // 2. 启动 GATT 服务
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! let server = GattServer::new("Bullsi", tx);
//! let _handle = server.start().await?;
//!
//! // 3. 周期性驱动控制循环
//! let mut ctrl = ControlLoop::new(lease, identity, Box::new(clock), Box::new(server.sessions()), wiper);
//! loop {
//!     ctrl.tick(rx.try_recv().ok());
//! }
//! ```

pub mod ble;
pub mod channel;
pub mod config;
pub mod control;
pub mod lease;
pub mod logging;
pub mod subscription;
pub mod wifi;

// BLE re-exports
pub use ble::client::{BleClient, BleClientError, DeviceConnection, DiscoveredDevice};
pub use ble::server::{GattServer, GattServerHandle, NotifySessions};
pub use ble::{Endpoint, SERVICE_UUID};

// Core re-exports
pub use channel::{ScanRecord, select_channel};
pub use config::DeviceSettings;
pub use control::{
    AuxService, CommandWipe, ControlEvent, ControlLink, ControlLoop, DeviceSnapshot,
    SessionIdentity, TickReport, WipeHandler,
};
pub use lease::{Clock, Denial, LeaseManager, LeaseStatus, ManualClock, MonotonicClock};
pub use logging::LogLevel;
pub use subscription::{SubscriberHandle, SubscriptionRegistry, ValueId};

// WiFi re-exports
pub use wifi::{NmRadio, Radio, WifiError};
