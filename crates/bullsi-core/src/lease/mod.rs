//! 租约授权 - 独占访问令牌的认领、保持、擦除与状态查询
//!
//! 设备启动时生成一次 8 位密钥，此后：
//!
//! - **claim**：任何对端都可以读取当前密钥（无需认证）
//! - **hold / 网络标识请求 / wipe**：必须回传密钥，成功后刷新租约计时
//! - **status**：纯读取，过期时立即报告 `unclaimed`，但不修改存储状态
//!
//! 过期租约只会被周期性清扫 ([`LeaseManager::sweep`]) 清除；在清扫之前，
//! 带着旧密钥的写命令会被拒绝为 [`Denial::Expired`]，清扫之后则为
//! [`Denial::Uninitialized`]。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

/// 租约密钥长度
pub const SECRET_LEN: usize = 8;

/// 会话网络名称长度
pub const NETWORK_NAME_LEN: usize = 6;

/// 单调时钟，返回毫秒
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// 基于进程内 `Instant` 的单调时钟
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// 手动推进的时钟，克隆体共享同一时间
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 生成指定长度的字母数字随机串
pub fn random_token<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}

/// 对外报告的租约状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Claimed,
    Unclaimed,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Claimed => "claimed",
            LeaseStatus::Unclaimed => "unclaimed",
        }
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 认证命令被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("lease expired")]
    Expired,

    #[error("no active lease")]
    Uninitialized,

    #[error("secret mismatch")]
    Mismatch,
}

/// 控制通道命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 读取当前密钥（无需认证）
    Claim,
    /// 刷新租约
    Hold(String),
    /// 请求推送会话网络名称
    NetworkIdentityRequest(String),
    /// 授权设备重置
    Wipe(String),
    /// 读取租约状态
    StatusQuery,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Claim => "claim",
            Command::Hold(_) => "hold",
            Command::NetworkIdentityRequest(_) => "network-identity-request",
            Command::Wipe(_) => "wipe",
            Command::StatusQuery => "status",
        }
    }
}

/// 命令处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// claim 返回的当前密钥（可能为空）
    Secret(String),
    /// status 返回的状态
    Status(LeaseStatus),
    /// hold 成功，计时已刷新
    Refreshed,
    /// 网络标识请求已授权，调用方应推送网络名称
    NetworkIdentityGranted,
    /// wipe 已授权，调用方应执行重置
    WipeAuthorized,
}

/// 由密钥与计时推导状态
///
/// 窗口为 0 时永不过期；过期判断使用严格大于。
pub fn derive_status(secret: &str, issued_at_ms: u64, window_ms: u64, now_ms: u64) -> LeaseStatus {
    if secret.is_empty() || lapsed(issued_at_ms, window_ms, now_ms) {
        LeaseStatus::Unclaimed
    } else {
        LeaseStatus::Claimed
    }
}

fn lapsed(issued_at_ms: u64, window_ms: u64, now_ms: u64) -> bool {
    window_ms > 0 && now_ms.saturating_sub(issued_at_ms) > window_ms
}

/// 租约实体
#[derive(Debug, Clone)]
struct Lease {
    secret: String,
    issued_at_ms: u64,
    window_ms: u64,
}

/// 租约状态机
#[derive(Debug)]
pub struct LeaseManager {
    lease: Lease,
}

impl LeaseManager {
    /// 使用给定密钥创建租约，计时从 `now_ms` 开始
    pub fn new(secret: impl Into<String>, now_ms: u64, window_ms: u64) -> Self {
        Self {
            lease: Lease {
                secret: secret.into(),
                issued_at_ms: now_ms,
                window_ms,
            },
        }
    }

    /// 随机生成密钥并创建租约
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, now_ms: u64, window_ms: u64) -> Self {
        let manager = Self::new(random_token(rng, SECRET_LEN), now_ms, window_ms);
        info!(
            "Lease created (window={}ms{})",
            window_ms,
            if window_ms == 0 { ", never expires" } else { "" }
        );
        manager
    }

    /// 当前密钥；过期清扫后为空
    pub fn secret(&self) -> &str {
        &self.lease.secret
    }

    pub fn window_ms(&self) -> u64 {
        self.lease.window_ms
    }

    pub fn issued_at_ms(&self) -> u64 {
        self.lease.issued_at_ms
    }

    /// 状态查询，永不修改存储状态
    pub fn status(&self, now_ms: u64) -> LeaseStatus {
        derive_status(
            &self.lease.secret,
            self.lease.issued_at_ms,
            self.lease.window_ms,
            now_ms,
        )
    }

    fn has_lapsed(&self, now_ms: u64) -> bool {
        !self.lease.secret.is_empty()
            && lapsed(self.lease.issued_at_ms, self.lease.window_ms, now_ms)
    }

    /// hold / 网络标识请求 / wipe 共用的认证步骤
    ///
    /// 成功时刷新计时。
    pub fn authorize(&mut self, provided: &str, now_ms: u64) -> Result<(), Denial> {
        if self.has_lapsed(now_ms) {
            return Err(Denial::Expired);
        }
        if self.lease.secret.is_empty() {
            return Err(Denial::Uninitialized);
        }
        if provided != self.lease.secret {
            return Err(Denial::Mismatch);
        }

        self.lease.issued_at_ms = now_ms;
        debug!("Lease refreshed at {now_ms}ms");
        Ok(())
    }

    /// 处理一条命令
    pub fn process(&mut self, command: &Command, now_ms: u64) -> Result<CommandOutcome, Denial> {
        let result = match command {
            Command::Claim => {
                // 有效租约被 claim 时同样刷新计时；已过期未清扫的租约不复活
                if !self.lease.secret.is_empty() && !self.has_lapsed(now_ms) {
                    self.lease.issued_at_ms = now_ms;
                }
                Ok(CommandOutcome::Secret(self.lease.secret.clone()))
            }
            Command::StatusQuery => Ok(CommandOutcome::Status(self.status(now_ms))),
            Command::Hold(secret) => self
                .authorize(secret, now_ms)
                .map(|()| CommandOutcome::Refreshed),
            Command::NetworkIdentityRequest(secret) => self
                .authorize(secret, now_ms)
                .map(|()| CommandOutcome::NetworkIdentityGranted),
            Command::Wipe(secret) => self
                .authorize(secret, now_ms)
                .map(|()| CommandOutcome::WipeAuthorized),
        };

        if let Err(denial) = &result {
            warn!("{} denied: {}", command.name(), denial);
        }
        result
    }

    /// 周期性过期清扫
    ///
    /// 返回 `true` 表示本次清除了租约，调用方应推送状态变化。
    pub fn sweep(&mut self, now_ms: u64) -> bool {
        if !self.has_lapsed(now_ms) {
            return false;
        }

        info!(
            "Lease expired after {}ms of inactivity, clearing",
            now_ms.saturating_sub(self.lease.issued_at_ms)
        );
        self.lease.secret.clear();
        self.lease.issued_at_ms = 0;
        true
    }
}
