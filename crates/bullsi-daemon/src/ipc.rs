//! IPC Server - Unix Domain Socket 通信
//!
//! 每行一个 JSON 请求，每行一个 JSON 响应。状态查询经控制循环处理，
//! 因此与 BLE 读写看到的是同一份状态。

use anyhow::Result;
use bullsi_core::{ControlEvent, DeviceSnapshot};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("bullsi.sock")
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "stop")]
    Stop,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status { snapshot: DeviceSnapshot },
}

pub async fn run_ipc_server(
    events: mpsc::Sender<ControlEvent>,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let events = events.clone();
                let shutdown = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, events, shutdown).await {
                        tracing::debug!("IPC 客户端断开: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    events: mpsc::Sender<ControlEvent>,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                tracing::debug!("收到请求: {:?}", request);
                handle_request(request, &events, &shutdown).await
            }
            Err(e) => IpcResponse::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        line.clear();
    }

    Ok(())
}

async fn handle_request(
    request: IpcRequest,
    events: &mpsc::Sender<ControlEvent>,
    shutdown: &watch::Sender<bool>,
) -> IpcResponse {
    match request {
        IpcRequest::Status => {
            let (reply, rx) = oneshot::channel();
            if events.send(ControlEvent::Snapshot { reply }).await.is_err() {
                return IpcResponse::Error {
                    message: "控制循环未运行".to_string(),
                };
            }
            match rx.await {
                Ok(snapshot) => IpcResponse::Status { snapshot },
                Err(_) => IpcResponse::Error {
                    message: "控制循环未响应".to_string(),
                },
            }
        }
        IpcRequest::Stop => {
            tracing::info!("收到停止请求");
            let _ = shutdown.send(true);
            IpcResponse::Ok {
                message: "已停止".to_string(),
            }
        }
    }
}
