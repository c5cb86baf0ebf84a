//! 控制循环 - 单线程调度租约、订阅与附属服务
//!
//! 每次 [`ControlLoop::tick`] 依次执行：
//!
//! 1. 过期清扫，清除时推送 `unclaimed` 状态
//! 2. 处理最多一个入站控制事件
//! 3. 驱动已注册的附属服务
//!
//! 所有状态只在 tick 内被修改，BLE 回调通过 channel 把事件投递进来，
//! 因此不需要锁。

mod wipe;

pub use wipe::{CommandWipe, WipeHandler};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::ble::Endpoint;
use crate::lease::{Clock, Command, CommandOutcome, Denial, LeaseManager, LeaseStatus};
use crate::subscription::{
    Delivery, LinkState, SubscriberHandle, SubscriptionRegistry, ValueId,
};

/// 传输层：查询连接状态并投递通知
pub trait ControlLink: LinkState + Send + Sync {
    /// 投递一条通知，返回是否已交给传输层
    fn deliver(&self, delivery: &Delivery) -> bool;
}

/// 附属服务，在每次 tick 的末尾被驱动
pub trait AuxService: Send {
    fn name(&self) -> &str;
    fn tick(&mut self);
}

/// 本次会话的网络标识
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub network_name: String,
    pub channel: u8,
}

/// 入站控制事件
#[derive(Debug)]
pub enum ControlEvent {
    /// 端点读取，结果通过 `reply` 返回
    Read {
        endpoint: Endpoint,
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// 端点写入，`payload` 已解码为密钥字符串
    Write { endpoint: Endpoint, payload: String },
    /// 通知开关
    Subscription {
        value_id: ValueId,
        handle: SubscriberHandle,
        enabled: bool,
    },
    /// 本地查询设备快照
    Snapshot {
        reply: oneshot::Sender<DeviceSnapshot>,
    },
}

impl ControlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ControlEvent::Read { endpoint, .. } | ControlEvent::Write { endpoint, .. } => {
                endpoint.name()
            }
            ControlEvent::Subscription { .. } => "subscription",
            ControlEvent::Snapshot { .. } => "snapshot",
        }
    }
}

/// 设备状态快照，不包含密钥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub status: LeaseStatus,
    pub network_name: String,
    pub channel: u8,
    pub expiration_ms: u64,
    pub subscriptions: Vec<SubscriptionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub value: ValueId,
    pub subscriber: SubscriberHandle,
}

/// 单次 tick 的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// 本次清扫清除了租约
    pub swept: bool,
    /// 处理的事件名称
    pub handled: Option<&'static str>,
    pub denial: Option<Denial>,
    /// 交给传输层的通知数
    pub delivered: usize,
    /// 已执行授权的 wipe，调用方应退出
    pub wipe_requested: bool,
}

/// 控制循环
pub struct ControlLoop {
    lease: LeaseManager,
    registry: SubscriptionRegistry,
    identity: SessionIdentity,
    clock: Box<dyn Clock>,
    link: Box<dyn ControlLink>,
    wiper: Box<dyn WipeHandler>,
    aux: Vec<Box<dyn AuxService>>,
}

impl ControlLoop {
    pub fn new(
        lease: LeaseManager,
        identity: SessionIdentity,
        clock: Box<dyn Clock>,
        link: Box<dyn ControlLink>,
        wiper: Box<dyn WipeHandler>,
    ) -> Self {
        let mut registry = SubscriptionRegistry::new();
        let now = clock.now_ms();
        // 预置初始值，此时还没有订阅者
        registry.notify_if_subscribed(
            ValueId::Status,
            lease.status(now).as_str().as_bytes(),
            link.as_ref(),
        );
        registry.notify_if_subscribed(
            ValueId::NetworkIdentity,
            identity.network_name.as_bytes(),
            link.as_ref(),
        );

        Self {
            lease,
            registry,
            identity,
            clock,
            link,
            wiper,
            aux: Vec::new(),
        }
    }

    /// 注册附属服务
    pub fn with_aux(mut self, service: Box<dyn AuxService>) -> Self {
        info!("Registered auxiliary service: {}", service.name());
        self.aux.push(service);
        self
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// 执行一次调度
    pub fn tick(&mut self, inbound: Option<ControlEvent>) -> TickReport {
        let mut report = TickReport::default();
        let now = self.clock.now_ms();

        if self.lease.sweep(now) {
            report.swept = true;
            let status = self.lease.status(now);
            report.delivered += self.publish(ValueId::Status, status.as_str().as_bytes());
        }

        if let Some(event) = inbound {
            report.handled = Some(event.name());
            self.handle_event(event, now, &mut report);
        }

        for service in &mut self.aux {
            service.tick();
        }

        report
    }

    fn handle_event(&mut self, event: ControlEvent, now: u64, report: &mut TickReport) {
        match event {
            ControlEvent::Read { endpoint, reply } => {
                let value = self.read(endpoint, now);
                if reply.send(value).is_err() {
                    debug!("Reader of {} went away before reply", endpoint.name());
                }
            }
            ControlEvent::Write { endpoint, payload } => {
                self.write(endpoint, payload, now, report);
            }
            ControlEvent::Subscription {
                value_id,
                handle,
                enabled,
            } => {
                self.registry.set_subscription(value_id, handle, enabled);
            }
            ControlEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn read(&mut self, endpoint: Endpoint, now: u64) -> Vec<u8> {
        let command = match endpoint {
            Endpoint::Claim => Command::Claim,
            Endpoint::Status => Command::StatusQuery,
            Endpoint::NetworkIdentity => {
                return self.identity.network_name.as_bytes().to_vec();
            }
            other => {
                warn!("Read on write-only endpoint {}", other.name());
                return Vec::new();
            }
        };

        match self.lease.process(&command, now) {
            Ok(CommandOutcome::Secret(secret)) => secret.into_bytes(),
            Ok(CommandOutcome::Status(status)) => status.as_str().as_bytes().to_vec(),
            Ok(_) | Err(_) => Vec::new(),
        }
    }

    fn write(&mut self, endpoint: Endpoint, payload: String, now: u64, report: &mut TickReport) {
        let command = match endpoint {
            Endpoint::Hold => Command::Hold(payload),
            Endpoint::NetworkIdentityRequest => Command::NetworkIdentityRequest(payload),
            Endpoint::Wipe => Command::Wipe(payload),
            other => {
                warn!("Write on read-only endpoint {}", other.name());
                return;
            }
        };

        match self.lease.process(&command, now) {
            Ok(CommandOutcome::NetworkIdentityGranted) => {
                let name = self.identity.network_name.clone();
                report.delivered += self.publish(ValueId::NetworkIdentity, name.as_bytes());
            }
            Ok(CommandOutcome::WipeAuthorized) => {
                info!("Wipe authorized, resetting device");
                self.wiper.wipe();
                report.wipe_requested = true;
            }
            Ok(_) => {}
            Err(denial) => report.denial = Some(denial),
        }
    }

    fn publish(&mut self, value_id: ValueId, value: &[u8]) -> usize {
        let Some(delivery) =
            self.registry
                .notify_if_subscribed(value_id, value, self.link.as_ref())
        else {
            return 0;
        };

        if self.link.deliver(&delivery) {
            debug!(
                "Notified {} of {} ({} bytes)",
                delivery.handle,
                value_id.name(),
                delivery.value.len()
            );
            1
        } else {
            warn!("Failed to hand {} notification to {}", value_id.name(), delivery.handle);
            0
        }
    }

    /// 当前设备快照
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            status: self.lease.status(self.clock.now_ms()),
            network_name: self.identity.network_name.clone(),
            channel: self.identity.channel,
            expiration_ms: self.lease.window_ms(),
            subscriptions: self
                .registry
                .subscriptions()
                .into_iter()
                .map(|(value, subscriber)| SubscriptionInfo { value, subscriber })
                .collect(),
        }
    }
}
