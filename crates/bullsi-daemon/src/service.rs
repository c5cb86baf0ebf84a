//! Core Service - 启动序列与控制循环驱动

use std::fmt;

use anyhow::Result;
use bullsi_core::lease::{NETWORK_NAME_LEN, random_token};
use bullsi_core::wifi::{self, Radio};
use bullsi_core::{
    Clock, CommandWipe, ControlEvent, ControlLoop, DeviceSettings, GattServer, LeaseManager,
    MonotonicClock, NmRadio,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// 服务结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// 授权 wipe 后退出，由服务管理器重新拉起
    Wiped,
    /// 本地 IPC 请求停止
    Stopped,
    Interrupted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExitReason::Wiped => "wiped",
            ExitReason::Stopped => "stopped",
            ExitReason::Interrupted => "interrupted",
        })
    }
}

pub async fn run_service(
    settings: DeviceSettings,
    events_tx: mpsc::Sender<ControlEvent>,
    mut events_rx: mpsc::Receiver<ControlEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ExitReason> {
    tracing::info!("核心服务初始化...");

    let clock = MonotonicClock::new();
    let (lease, network_name) = {
        let mut rng = rand::thread_rng();
        let lease = LeaseManager::generate(&mut rng, clock.now_ms(), settings.expiration_ms);
        (lease, random_token(&mut rng, NETWORK_NAME_LEN))
    };

    // 热点失败不影响 BLE 控制通道
    let radio = NmRadio::new(&settings.wifi_interface, settings.scan_settle());
    let identity = wifi::bring_up(&radio, network_name, lease.secret()).await;
    tracing::info!(
        "会话网络: {} (信道 {})",
        identity.network_name,
        identity.channel
    );

    let server = GattServer::new(settings.device_name.clone(), events_tx);
    let _gatt = match server.start().await {
        Ok(handle) => handle,
        Err(e) => {
            stop_access_point(&radio).await;
            return Err(e);
        }
    };

    let mut ctrl = ControlLoop::new(
        lease,
        identity,
        Box::new(clock),
        Box::new(server.sessions()),
        Box::new(CommandWipe::from_command_line(
            settings.wipe_command.as_deref(),
        )),
    );

    let mut interval = tokio::time::interval(settings.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tracing::info!("控制循环已启动，周期 {:?}", settings.tick_interval());
    let reason = loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break ExitReason::Stopped,
            _ = &mut ctrl_c => break ExitReason::Interrupted,
        }

        let report = ctrl.tick(events_rx.try_recv().ok());
        if let Some(denial) = report.denial {
            tracing::debug!("{:?} 被拒绝: {}", report.handled, denial);
        }
        if report.wipe_requested {
            break ExitReason::Wiped;
        }
    };

    stop_access_point(&radio).await;
    Ok(reason)
}

async fn stop_access_point(radio: &dyn Radio) {
    if let Err(e) = radio.stop_access_point().await {
        tracing::warn!("停止热点失败: {}", e);
    }
}
