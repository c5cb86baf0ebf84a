//! 设备配置和持久化
//!
//! 设备名称、无线接口、租约窗口等设置的存储和读取。
//! 配置文件缺失的字段使用默认值。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogLevel;

/// 默认租约窗口 (ms)
pub const DEFAULT_EXPIRATION_MS: u64 = 3_000;

/// 设备设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// BLE 广播名称
    pub device_name: String,
    /// 热点使用的 WiFi 接口
    pub wifi_interface: String,
    /// 租约无活动过期窗口 (ms)，0 表示永不过期
    pub expiration_ms: u64,
    /// 控制循环周期 (ms)
    pub tick_interval_ms: u64,
    /// 触发扫描后等待结果的时间 (ms)
    pub scan_settle_ms: u64,
    /// 授权 wipe 后执行的命令，按空白拆分
    pub wipe_command: Option<String>,
    /// 日志级别
    pub log_level: LogLevel,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_name: "Bullsi".to_string(),
            wifi_interface: "wlan0".to_string(),
            expiration_ms: DEFAULT_EXPIRATION_MS,
            tick_interval_ms: 50,
            scan_settle_ms: 2_000,
            wipe_command: None,
            log_level: LogLevel::Info,
        }
    }
}

impl DeviceSettings {
    /// 默认配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bullsi")
            .join("settings.toml")
    }

    /// 从默认路径加载
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 加载设置（如果文件不存在或无法解析则使用默认值）
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            debug!("No settings at {:?}, using defaults", path);
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    debug!("Loaded settings from {:?}", path);
                    return settings;
                }
                Err(e) => warn!("Failed to parse settings: {}, using defaults", e),
            },
            Err(e) => warn!("Failed to read settings file: {}, using defaults", e),
        }
        Self::default()
    }

    /// 保存设置
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn scan_settle(&self) -> Duration {
        Duration::from_millis(self.scan_settle_ms)
    }
}
