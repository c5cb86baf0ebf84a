//! 集成测试 - 完整配网会话
//!
//! 通过公开接口驱动控制循环：claim → hold → 网络标识请求 → 过期 / wipe。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bullsi_core::control::{ControlLink, WipeHandler};
use bullsi_core::subscription::{Delivery, LinkState};
use bullsi_core::{
    Clock, ControlEvent, ControlLoop, Denial, Endpoint, LeaseManager, LeaseStatus, ManualClock,
    NotifySessions, SessionIdentity, SubscriberHandle, ValueId,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::oneshot;

const WINDOW: u64 = 3_000;

#[derive(Clone, Default)]
struct Link {
    live: Arc<Mutex<HashSet<SubscriberHandle>>>,
    sent: Arc<Mutex<Vec<Delivery>>>,
}

impl LinkState for Link {
    fn is_connection_live(&self, handle: SubscriberHandle) -> bool {
        self.live.lock().unwrap().contains(&handle)
    }
}

impl ControlLink for Link {
    fn deliver(&self, delivery: &Delivery) -> bool {
        self.sent.lock().unwrap().push(delivery.clone());
        true
    }
}

#[derive(Clone, Default)]
struct Wiped(Arc<AtomicBool>);

impl WipeHandler for Wiped {
    fn wipe(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn read(ctrl: &mut ControlLoop, endpoint: Endpoint) -> String {
    let (reply, mut rx) = oneshot::channel();
    ctrl.tick(Some(ControlEvent::Read { endpoint, reply }));
    String::from_utf8(rx.try_recv().unwrap()).unwrap()
}

fn write(ctrl: &mut ControlLoop, endpoint: Endpoint, payload: &str) -> Option<Denial> {
    ctrl.tick(Some(ControlEvent::Write {
        endpoint,
        payload: payload.to_string(),
    }))
    .denial
}

fn session() -> (ControlLoop, ManualClock, Link, Wiped) {
    let clock = ManualClock::new(1_000);
    let link = Link::default();
    let wiped = Wiped::default();
    let mut rng = StdRng::seed_from_u64(2024);
    let ctrl = ControlLoop::new(
        LeaseManager::generate(&mut rng, 1_000, WINDOW),
        SessionIdentity {
            network_name: "x7Qp2z".to_string(),
            channel: 1,
        },
        Box::new(clock.clone()),
        Box::new(link.clone()),
        Box::new(wiped.clone()),
    );
    (ctrl, clock, link, wiped)
}

/// 配网端完成一次完整会话并最终放弃租约
#[test]
fn test_onboarding_session_then_expiry() {
    let (mut ctrl, clock, link, _) = session();
    link.live.lock().unwrap().insert(SubscriberHandle(1));

    // 订阅网络标识和状态
    for value_id in [ValueId::NetworkIdentity, ValueId::Status] {
        ctrl.tick(Some(ControlEvent::Subscription {
            value_id,
            handle: SubscriberHandle(1),
            enabled: true,
        }));
    }

    let secret = read(&mut ctrl, Endpoint::Claim);
    assert_eq!(secret.len(), 8);
    assert_eq!(read(&mut ctrl, Endpoint::Status), "claimed");

    // 每 2 秒保持一次，持续 20 秒
    for _ in 0..10 {
        clock.advance(2_000);
        assert_eq!(write(&mut ctrl, Endpoint::Hold, &secret), None);
    }

    assert_eq!(
        write(&mut ctrl, Endpoint::NetworkIdentityRequest, &secret),
        None
    );

    // 停止保持，超过窗口后清扫
    clock.advance(WINDOW + 1);
    assert!(ctrl.tick(None).swept);
    assert_eq!(read(&mut ctrl, Endpoint::Status), "unclaimed");

    let sent = link.sent.lock().unwrap().clone();
    let values: Vec<_> = sent
        .iter()
        .map(|d| (d.value_id, String::from_utf8_lossy(&d.value).into_owned()))
        .collect();
    assert_eq!(
        values,
        vec![
            (ValueId::NetworkIdentity, "x7Qp2z".to_string()),
            (ValueId::Status, "unclaimed".to_string()),
        ]
    );

    assert_eq!(read(&mut ctrl, Endpoint::Claim), "");
    assert_eq!(
        write(&mut ctrl, Endpoint::Hold, &secret),
        Some(Denial::Uninitialized)
    );
}

/// 过期但尚未清扫时，状态已报告 unclaimed 而密钥仍在
#[test]
fn test_status_sees_expiry_before_sweep() {
    let (mut ctrl, clock, _, _) = session();
    let secret = read(&mut ctrl, Endpoint::Claim);

    clock.advance(WINDOW + 1);
    assert_eq!(ctrl.lease().status(clock.now_ms()), LeaseStatus::Unclaimed);
    assert_eq!(ctrl.lease().secret(), secret);
    assert_eq!(ctrl.snapshot().status, LeaseStatus::Unclaimed);
}

#[test]
fn test_wipe_requires_secret() {
    let (mut ctrl, _, _, wiped) = session();
    let secret = read(&mut ctrl, Endpoint::Claim);

    assert_eq!(write(&mut ctrl, Endpoint::Wipe, "00000000"), Some(Denial::Mismatch));
    assert!(!wiped.0.load(Ordering::SeqCst));

    let report = ctrl.tick(Some(ControlEvent::Write {
        endpoint: Endpoint::Wipe,
        payload: secret,
    }));
    assert!(report.wipe_requested);
    assert!(wiped.0.load(Ordering::SeqCst));
}

/// 使用 BLE 服务端的会话登记表作为传输层
#[tokio::test]
async fn test_notify_sessions_as_control_link() {
    let clock = ManualClock::new(0);
    let sessions = NotifySessions::new();
    let mut ctrl = ControlLoop::new(
        LeaseManager::new("Ab3dEf9h", 0, WINDOW),
        SessionIdentity {
            network_name: "x7Qp2z".to_string(),
            channel: 6,
        },
        Box::new(clock.clone()),
        Box::new(sessions.clone()),
        Box::new(Wiped::default()),
    );

    // 未登记的会话不算在线，通知不会投递
    ctrl.tick(Some(ControlEvent::Subscription {
        value_id: ValueId::Status,
        handle: SubscriberHandle(42),
        enabled: true,
    }));
    clock.set(WINDOW + 1);
    let report = ctrl.tick(None);
    assert!(report.swept);
    assert_eq!(report.delivered, 0);
}
