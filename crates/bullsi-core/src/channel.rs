//! 信道选择 - 根据扫描结果挑选干扰最小的 2.4GHz 信道
//!
//! 每条扫描记录对候选信道 `c` 的干扰贡献为：
//!
//! ```text
//! weight(|r.channel - c|) * max(0, r.signal_strength + 100)
//! ```
//!
//! 其中 `weight` 按信道间隔取 1.0 / 0.5 / 0.25，间隔超过 2 时为 0。
//! 选择惩罚值最小的信道，相同时取编号最小者。

use log::{debug, info, warn};

/// 候选信道上限（信道 1..=11）
pub const CHANNEL_COUNT: u8 = 11;

/// 扫描失败或无结果时使用的信道
pub const FALLBACK_CHANNEL: u8 = 6;

/// 将信号强度 (dBm) 平移到非负区间的基准值
pub const INTERFERENCE_BASE: f32 = 100.0;

/// 一次扫描中观察到的邻近网络
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRecord {
    /// 信道编号
    pub channel: u8,
    /// 信号强度 (dBm)，越负越弱
    pub signal_strength: i16,
}

impl ScanRecord {
    pub fn new(channel: u8, signal_strength: i16) -> Self {
        Self {
            channel,
            signal_strength,
        }
    }
}

/// 按信道间隔返回权重
pub fn weight(offset: u8) -> f32 {
    match offset {
        0 => 1.0,
        1 => 0.5,
        2 => 0.25,
        _ => 0.0,
    }
}

/// 计算信道 `channel` 上的干扰惩罚值
pub fn penalty(records: &[ScanRecord], channel: u8) -> f32 {
    records
        .iter()
        .map(|r| {
            let w = weight(r.channel.abs_diff(channel));
            if w == 0.0 {
                return 0.0;
            }
            w * (f32::from(r.signal_strength) + INTERFERENCE_BASE).max(0.0)
        })
        .sum()
}

/// 从扫描记录中选出惩罚值最小的信道
///
/// 纯函数：相同输入总是得到相同输出，不依赖任何无线硬件。
pub fn select_channel(records: &[ScanRecord]) -> u8 {
    if records.is_empty() {
        debug!("No networks observed, using fallback channel {FALLBACK_CHANNEL}");
        return FALLBACK_CHANNEL;
    }

    let mut best = 1;
    let mut best_penalty = f32::INFINITY;
    for channel in 1..=CHANNEL_COUNT {
        let p = penalty(records, channel);
        debug!("Channel {channel}: penalty={p:.2}");
        // 严格小于，保证平局时保留编号最小的信道
        if p < best_penalty {
            best = channel;
            best_penalty = p;
        }
    }

    info!(
        "Selected channel {} (penalty={:.2}) from {} scan records",
        best,
        best_penalty,
        records.len()
    );
    best
}

/// 处理扫描源的结果：扫描失败与空结果都回退到固定信道
pub fn select_from_scan<E: std::fmt::Display>(scan: Result<Vec<ScanRecord>, E>) -> u8 {
    match scan {
        Ok(records) => select_channel(&records),
        Err(e) => {
            warn!("Scan unavailable ({e}), using fallback channel {FALLBACK_CHANNEL}");
            FALLBACK_CHANNEL
        }
    }
}
