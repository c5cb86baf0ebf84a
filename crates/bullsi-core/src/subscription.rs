//! 订阅登记 - 每个可通知的值最多记录一个订阅者
//!
//! 新订阅者会静默替换旧订阅者；取消订阅只在句柄匹配当前订阅者时生效，
//! 避免后来者的取消把前一个对端的订阅踢掉。值变化时只有订阅者仍在线
//! （实时向传输层查询，不缓存）才产生投递。

use std::collections::HashMap;
use std::fmt;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// 远端对端（一次通知会话）的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberHandle(pub u64);

impl fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 可被订阅的值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueId {
    Status,
    NetworkIdentity,
}

impl ValueId {
    pub fn name(&self) -> &'static str {
        match self {
            ValueId::Status => "status",
            ValueId::NetworkIdentity => "network-identity",
        }
    }
}

/// 传输层连接状态查询
pub trait LinkState {
    /// 对端连接当前是否仍然存活
    fn is_connection_live(&self, handle: SubscriberHandle) -> bool;
}

/// 一次待投递的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub handle: SubscriberHandle,
    pub value_id: ValueId,
    pub value: Vec<u8>,
}

#[derive(Debug, Default)]
struct Slot {
    subscriber: Option<SubscriberHandle>,
    enabled: bool,
    value: Vec<u8>,
}

/// 订阅登记表
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    slots: HashMap<ValueId, Slot>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 处理订阅开关
    pub fn set_subscription(&mut self, value_id: ValueId, handle: SubscriberHandle, enabled: bool) {
        let slot = self.slots.entry(value_id).or_default();

        if enabled {
            if let Some(previous) = slot.subscriber
                && previous != handle
            {
                debug!(
                    "Subscriber {} replaces {} on {}",
                    handle,
                    previous,
                    value_id.name()
                );
            }
            slot.subscriber = Some(handle);
            slot.enabled = true;
            debug!("{} subscribed to {}", handle, value_id.name());
            return;
        }

        if slot.subscriber == Some(handle) {
            slot.subscriber = None;
            slot.enabled = false;
            debug!("{} unsubscribed from {}", handle, value_id.name());
        } else {
            trace!(
                "Ignoring stale unsubscribe from {} on {}",
                handle,
                value_id.name()
            );
        }
    }

    /// 当前订阅者
    pub fn subscriber(&self, value_id: ValueId) -> Option<SubscriberHandle> {
        self.slots
            .get(&value_id)
            .filter(|slot| slot.enabled)
            .and_then(|slot| slot.subscriber)
    }

    /// 最近一次记录的值
    pub fn value(&self, value_id: ValueId) -> &[u8] {
        self.slots
            .get(&value_id)
            .map(|slot| slot.value.as_slice())
            .unwrap_or_default()
    }

    /// 记录新值，并在订阅者在线时返回投递目标
    pub fn notify_if_subscribed<L: LinkState + ?Sized>(
        &mut self,
        value_id: ValueId,
        new_value: &[u8],
        link: &L,
    ) -> Option<Delivery> {
        let slot = self.slots.entry(value_id).or_default();
        slot.value = new_value.to_vec();

        let handle = slot.subscriber.filter(|_| slot.enabled)?;
        if !link.is_connection_live(handle) {
            debug!(
                "Subscriber {} on {} is gone, keeping value without delivery",
                handle,
                value_id.name()
            );
            return None;
        }

        Some(Delivery {
            handle,
            value_id,
            value: new_value.to_vec(),
        })
    }

    /// 所有有效订阅 (值, 订阅者)
    pub fn subscriptions(&self) -> Vec<(ValueId, SubscriberHandle)> {
        let mut subs: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.enabled)
            .filter_map(|(id, slot)| slot.subscriber.map(|h| (*id, h)))
            .collect();
        subs.sort_by_key(|(id, _)| id.name());
        subs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeLink {
        live: HashSet<SubscriberHandle>,
    }

    impl FakeLink {
        fn with(handles: &[u64]) -> Self {
            Self {
                live: handles.iter().map(|h| SubscriberHandle(*h)).collect(),
            }
        }
    }

    impl LinkState for FakeLink {
        fn is_connection_live(&self, handle: SubscriberHandle) -> bool {
            self.live.contains(&handle)
        }
    }

    const A: SubscriberHandle = SubscriberHandle(1);
    const B: SubscriberHandle = SubscriberHandle(2);

    #[test]
    fn test_no_subscriber_no_delivery() {
        let mut registry = SubscriptionRegistry::new();
        let link = FakeLink::with(&[1]);

        assert!(
            registry
                .notify_if_subscribed(ValueId::Status, b"claimed", &link)
                .is_none()
        );
        // 值仍然被记录
        assert_eq!(registry.value(ValueId::Status), b"claimed");
    }

    #[test]
    fn test_delivery_to_live_subscriber() {
        let mut registry = SubscriptionRegistry::new();
        let link = FakeLink::with(&[1]);
        registry.set_subscription(ValueId::Status, A, true);

        let delivery = registry
            .notify_if_subscribed(ValueId::Status, b"unclaimed", &link)
            .unwrap();
        assert_eq!(
            delivery,
            Delivery {
                handle: A,
                value_id: ValueId::Status,
                value: b"unclaimed".to_vec(),
            }
        );
    }

    #[test]
    fn test_second_subscriber_replaces_first() {
        let mut registry = SubscriptionRegistry::new();
        let link = FakeLink::with(&[1, 2]);

        registry.set_subscription(ValueId::NetworkIdentity, A, true);
        registry.set_subscription(ValueId::NetworkIdentity, B, true);

        let delivery = registry
            .notify_if_subscribed(ValueId::NetworkIdentity, b"x7Qp2z", &link)
            .unwrap();
        assert_eq!(delivery.handle, B);

        // A 被替换后再发取消订阅不影响 B
        registry.set_subscription(ValueId::NetworkIdentity, A, false);
        assert_eq!(registry.subscriber(ValueId::NetworkIdentity), Some(B));
        let delivery = registry
            .notify_if_subscribed(ValueId::NetworkIdentity, b"x7Qp2z", &link)
            .unwrap();
        assert_eq!(delivery.handle, B);
    }

    #[test]
    fn test_matching_unsubscribe_clears() {
        let mut registry = SubscriptionRegistry::new();
        let link = FakeLink::with(&[1]);

        registry.set_subscription(ValueId::Status, A, true);
        registry.set_subscription(ValueId::Status, A, false);

        assert_eq!(registry.subscriber(ValueId::Status), None);
        assert!(
            registry
                .notify_if_subscribed(ValueId::Status, b"claimed", &link)
                .is_none()
        );
    }

    #[test]
    fn test_dead_connection_keeps_value_without_delivery() {
        let mut registry = SubscriptionRegistry::new();
        let link = FakeLink::default();

        registry.set_subscription(ValueId::Status, A, true);
        assert!(
            registry
                .notify_if_subscribed(ValueId::Status, b"unclaimed", &link)
                .is_none()
        );
        assert_eq!(registry.value(ValueId::Status), b"unclaimed");
        // 订阅记录本身保留
        assert_eq!(registry.subscriber(ValueId::Status), Some(A));
    }

    #[test]
    fn test_values_are_independent() {
        let mut registry = SubscriptionRegistry::new();
        registry.set_subscription(ValueId::Status, A, true);
        registry.set_subscription(ValueId::NetworkIdentity, B, true);

        assert_eq!(
            registry.subscriptions(),
            vec![(ValueId::NetworkIdentity, B), (ValueId::Status, A)]
        );
    }
}
