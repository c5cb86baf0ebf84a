//! Bullsi Daemon
//!
//! 设备端守护进程，负责：
//! - 扫描周边网络并在干扰最小的信道上启动热点
//! - BLE GATT 控制服务（claim / hold / 网络标识 / wipe / status）
//! - 周期性驱动控制循环
//! - 通过 Unix Socket 提供本地状态查询

mod ipc;
mod service;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use bullsi_core::{DeviceSettings, LogLevel};
use clap::Parser;
use service::ExitReason;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// 控制事件队列深度
const EVENT_QUEUE: usize = 64;

#[derive(Parser)]
#[command(name = "bullsi-daemon", version, about = "无头设备 BLE 配网守护进程")]
struct Args {
    /// 配置文件路径 (默认: ~/.config/bullsi/settings.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖租约过期窗口 (ms)，0 表示永不过期
    #[arg(long)]
    expiration_ms: Option<u64>,

    /// 覆盖热点使用的 WiFi 接口
    #[arg(long)]
    interface: Option<String>,

    /// 覆盖日志级别 (error/warn/info/debug/trace)
    #[arg(long)]
    log_level: Option<LogLevel>,
}

impl Args {
    fn settings(&self) -> DeviceSettings {
        let mut settings = match &self.config {
            Some(path) => DeviceSettings::load_from(path),
            None => DeviceSettings::load(),
        };
        if let Some(ms) = self.expiration_ms {
            settings.expiration_ms = ms;
        }
        if let Some(iface) = &self.interface {
            settings.wifi_interface.clone_from(iface);
        }
        if let Some(level) = self.log_level {
            settings.log_level = level;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = args.settings();

    // 桥接 log crate（bullsi-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志，RUST_LOG 优先
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.filter_directive())),
        )
        .try_init();

    tracing::info!("Bullsi Daemon starting...");
    tracing::debug!("配置: {:?}", settings);

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // 发送端始终由 main 持有一份，IPC 退出不等于停止请求
    let shutdown_tx = Arc::new(shutdown_tx);

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(
        events_tx.clone(),
        Arc::clone(&shutdown_tx),
    ));

    let service = service::run_service(settings, events_tx, events_rx, shutdown_rx);
    let (result, ipc_failure) = supervise(service, ipc_handle).await;

    let _ = std::fs::remove_file(ipc::socket_path());

    match result {
        Ok(reason) => tracing::info!("核心服务结束: {}", reason),
        Err(e) => {
            tracing::error!("核心服务失败: {:#}", e);
            return Err(e);
        }
    }
    match ipc_failure {
        Some(e) => Err(e.context("IPC 服务器异常退出")),
        None => Ok(()),
    }
}

/// 等待核心服务结束
///
/// IPC 服务器提前退出时只记录错误，核心服务继续运行直到自行结束，
/// 保证热点在退出前被关闭。返回服务结果和 IPC 的失败原因。
async fn supervise<S>(
    service: S,
    mut ipc_handle: JoinHandle<Result<()>>,
) -> (Result<ExitReason>, Option<anyhow::Error>)
where
    S: Future<Output = Result<ExitReason>>,
{
    tokio::pin!(service);
    let mut ipc_failure = None;

    let result = loop {
        tokio::select! {
            res = &mut service => break res,
            res = &mut ipc_handle, if ipc_failure.is_none() => {
                let err = match res {
                    Ok(Ok(())) => anyhow!("IPC server stopped unexpectedly"),
                    Ok(Err(e)) => e,
                    Err(e) => e.into(),
                };
                tracing::error!("IPC 服务器退出，BLE 控制通道继续运行: {:#}", err);
                ipc_failure = Some(err);
            }
        }
    };

    if ipc_failure.is_none() {
        ipc_handle.abort();
    }
    (result, ipc_failure)
}
