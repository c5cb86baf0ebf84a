//! GATT Server - 设备端 BLE 控制服务
//!
//! 发布一个主服务和六个特征：
//!
//! | 特征 | 属性 |
//! |------|------|
//! | claim | read |
//! | hold | write |
//! | network-identity-request | write |
//! | network-identity | read, notify |
//! | wipe | write |
//! | status | read, notify |
//!
//! 回调本身不持有任何业务状态，只把读写与订阅事件投递给控制循环。
//! 每个通知会话分配一个 [`SubscriberHandle`]，登记在 [`NotifySessions`] 中，
//! 控制循环通过它查询连接状态并投递通知。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bluer::{
    adv::Advertisement,
    gatt::local::{
        Application, Characteristic, CharacteristicNotifier, CharacteristicNotify,
        CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, ReqError, Service,
    },
};
use futures_util::FutureExt;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot};

use crate::ble::{Endpoint, SERVICE_UUID, decode_payload};
use crate::control::{ControlEvent, ControlLink};
use crate::subscription::{Delivery, LinkState, SubscriberHandle, ValueId};

/// 每个通知会话的待发队列深度
const NOTIFY_QUEUE: usize = 4;

/// 活跃的通知会话
#[derive(Clone, Default)]
pub struct NotifySessions {
    next: Arc<AtomicU64>,
    senders: Arc<Mutex<HashMap<SubscriberHandle, mpsc::Sender<Vec<u8>>>>>,
}

impl NotifySessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self) -> (SubscriberHandle, mpsc::Receiver<Vec<u8>>) {
        let handle = SubscriberHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE);
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(handle, tx);
        }
        (handle, rx)
    }

    fn unregister(&self, handle: SubscriberHandle) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(&handle);
        }
    }

    /// 当前会话数
    pub fn len(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 驱动一个通知会话直到对端停止订阅
    async fn serve(
        &self,
        value_id: ValueId,
        mut notifier: CharacteristicNotifier,
        events: mpsc::Sender<ControlEvent>,
    ) {
        let (handle, mut rx) = self.register();
        debug!("Notify session {} opened on {}", handle, value_id.name());

        let opened = ControlEvent::Subscription {
            value_id,
            handle,
            enabled: true,
        };
        if events.send(opened).await.is_err() {
            self.unregister(handle);
            return;
        }

        loop {
            tokio::select! {
                value = rx.recv() => {
                    let Some(value) = value else { break };
                    trace!("Notifying {} on {} ({} bytes)", handle, value_id.name(), value.len());
                    if let Err(e) = notifier.notify(value).await {
                        warn!("Notify to {} failed: {}", handle, e);
                        break;
                    }
                }
                _ = notifier.stopped() => break,
            }
        }

        self.unregister(handle);
        debug!("Notify session {} closed on {}", handle, value_id.name());
        let _ = events
            .send(ControlEvent::Subscription {
                value_id,
                handle,
                enabled: false,
            })
            .await;
    }
}

impl LinkState for NotifySessions {
    fn is_connection_live(&self, handle: SubscriberHandle) -> bool {
        self.senders
            .lock()
            .map(|s| s.get(&handle).is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

impl ControlLink for NotifySessions {
    fn deliver(&self, delivery: &Delivery) -> bool {
        let Ok(senders) = self.senders.lock() else {
            return false;
        };
        senders
            .get(&delivery.handle)
            .is_some_and(|tx| tx.try_send(delivery.value.clone()).is_ok())
    }
}

/// GATT Server
pub struct GattServer {
    device_name: String,
    events: mpsc::Sender<ControlEvent>,
    sessions: NotifySessions,
}

impl GattServer {
    pub fn new(device_name: impl Into<String>, events: mpsc::Sender<ControlEvent>) -> Self {
        Self {
            device_name: device_name.into(),
            events,
            sessions: NotifySessions::new(),
        }
    }

    /// 通知会话登记表，交给控制循环作为传输层
    pub fn sessions(&self) -> NotifySessions {
        self.sessions.clone()
    }

    fn characteristic(&self, endpoint: Endpoint) -> Characteristic {
        let read = endpoint
            .is_readable()
            .then(|| read_handler(endpoint, self.events.clone()));
        let write = endpoint
            .is_writable()
            .then(|| write_handler(endpoint, self.events.clone()));
        let notify = endpoint
            .value_id()
            .map(|value_id| notify_handler(value_id, self.sessions.clone(), self.events.clone()));

        Characteristic {
            uuid: endpoint.uuid(),
            read,
            write,
            notify,
            ..Default::default()
        }
    }

    /// 启动 GATT 服务与广播
    pub async fn start(&self) -> anyhow::Result<GattServerHandle> {
        debug!("Initializing BLE session...");
        let session = bluer::Session::new().await?;

        debug!("Getting default adapter...");
        let adapter = session.default_adapter().await?;

        let adapter_name = adapter.name().to_string();
        debug!("Powering on adapter: {}", adapter_name);
        adapter.set_powered(true).await?;

        let app = Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics: Endpoint::ALL
                    .iter()
                    .map(|e| self.characteristic(*e))
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };

        debug!("Registering GATT application with service_uuid={}", SERVICE_UUID);
        let app_handle = adapter.serve_gatt_application(app).await?;
        debug!("GATT application registered successfully");

        let mut service_uuids = BTreeSet::new();
        service_uuids.insert(SERVICE_UUID);

        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids,
            local_name: Some(self.device_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };

        debug!(
            "Starting BLE advertisement: service_uuid={}, local_name={}",
            SERVICE_UUID, self.device_name
        );
        let adv_handle = adapter.advertise(adv).await?;

        info!(
            "GATT Server started on {}, device_name='{}'",
            adapter_name, self.device_name
        );

        Ok(GattServerHandle {
            _adv_handle: adv_handle,
            _app_handle: app_handle,
            _session: session,
        })
    }
}

fn read_handler(endpoint: Endpoint, events: mpsc::Sender<ControlEvent>) -> CharacteristicRead {
    CharacteristicRead {
        read: true,
        fun: Box::new(move |req| {
            let events = events.clone();
            async move {
                let (reply, rx) = oneshot::channel();
                events
                    .send(ControlEvent::Read { endpoint, reply })
                    .await
                    .map_err(|_| ReqError::Failed)?;
                let value = rx.await.map_err(|_| ReqError::Failed)?;

                let offset = req.offset as usize;
                debug!(
                    "{} read by {}: offset={}, data_len={}",
                    endpoint.name(),
                    req.device_address,
                    offset,
                    value.len()
                );
                if offset >= value.len() {
                    return Ok(vec![]);
                }
                Ok(value[offset..].to_vec())
            }
            .boxed()
        }),
        ..Default::default()
    }
}

fn write_handler(endpoint: Endpoint, events: mpsc::Sender<ControlEvent>) -> CharacteristicWrite {
    CharacteristicWrite {
        write: true,
        write_without_response: true,
        method: CharacteristicWriteMethod::Fun(Box::new(move |data, req| {
            let events = events.clone();
            async move {
                debug!(
                    "{} written by {} ({} bytes)",
                    endpoint.name(),
                    req.device_address,
                    data.len()
                );
                events
                    .send(ControlEvent::Write {
                        endpoint,
                        payload: decode_payload(&data),
                    })
                    .await
                    .map_err(|_| ReqError::Failed)
            }
            .boxed()
        })),
        ..Default::default()
    }
}

fn notify_handler(
    value_id: ValueId,
    sessions: NotifySessions,
    events: mpsc::Sender<ControlEvent>,
) -> CharacteristicNotify {
    CharacteristicNotify {
        notify: true,
        method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
            let sessions = sessions.clone();
            let events = events.clone();
            async move { sessions.serve(value_id, notifier, events).await }.boxed()
        })),
        ..Default::default()
    }
}

/// GATT Server Handle - 保持服务运行
pub struct GattServerHandle {
    _adv_handle: bluer::adv::AdvertisementHandle,
    _app_handle: bluer::gatt::local::ApplicationHandle,
    _session: bluer::Session,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handle_is_not_live() {
        let sessions = NotifySessions::new();
        assert!(!sessions.is_connection_live(SubscriberHandle(1)));
        assert!(!sessions.deliver(&Delivery {
            handle: SubscriberHandle(1),
            value_id: ValueId::Status,
            value: b"unclaimed".to_vec(),
        }));
    }

    #[tokio::test]
    async fn test_registered_session_receives_delivery() {
        let sessions = NotifySessions::new();
        let (handle, mut rx) = sessions.register();
        assert_eq!(handle, SubscriberHandle(1));
        assert!(sessions.is_connection_live(handle));

        let delivered = sessions.deliver(&Delivery {
            handle,
            value_id: ValueId::Status,
            value: b"unclaimed".to_vec(),
        });
        assert!(delivered);
        assert_eq!(rx.recv().await.unwrap(), b"unclaimed");
    }

    #[test]
    fn test_dropped_receiver_is_not_live() {
        let sessions = NotifySessions::new();
        let (handle, rx) = sessions.register();
        drop(rx);
        assert!(!sessions.is_connection_live(handle));

        sessions.unregister(handle);
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_handles_are_unique() {
        let sessions = NotifySessions::new();
        let (a, _rx_a) = sessions.register();
        let (b, _rx_b) = sessions.register();
        assert_ne!(a, b);
        assert_eq!(sessions.len(), 2);
    }
}
