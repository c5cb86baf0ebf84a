//! Bullsi CLI
//!
//! 配网端命令行工具：通过 BLE 认领设备、保持租约、获取会话网络并加入，
//! 也可以通过 Unix Socket 查询本机守护进程

mod client;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use bullsi_core::wifi::nm_dbus::NmClient;
use bullsi_core::{BleClient, DeviceConnection};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bullsi", version, about = "无头设备 BLE 配网工具")]
struct Cli {
    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 查找设备的超时时间 (秒)
    #[arg(short, long, global = true, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近的设备
    Discover,
    /// 读取设备当前密钥
    Claim {
        /// 设备地址或名称
        device: String,
    },
    /// 读取租约状态
    Status { device: String },
    /// 保持租约
    Hold {
        device: String,
        /// 密钥 (不指定则先 claim)
        #[arg(short, long)]
        secret: Option<String>,
        /// 持续保持直到 Ctrl-C
        #[arg(short, long)]
        keep: bool,
        /// 持续保持时的间隔 (毫秒)
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
    /// 请求会话网络名称
    Identity {
        device: String,
        #[arg(short, long)]
        secret: Option<String>,
    },
    /// 重置设备
    Wipe {
        device: String,
        #[arg(short, long)]
        secret: Option<String>,
    },
    /// 认领设备并加入其热点
    Join {
        device: String,
        /// 本机 WiFi 接口 (默认自动选择)
        #[arg(short, long)]
        interface: Option<String>,
    },
    /// 查询本机守护进程
    Local {
        #[command(subcommand)]
        command: LocalCommands,
    },
}

#[derive(Subcommand)]
enum LocalCommands {
    /// 查看设备状态
    Status,
    /// 停止守护进程
    Stop,
}

/// 连接设备，未提供密钥时先 claim
async fn connect_with_secret(
    device: &str,
    secret: Option<String>,
    timeout: Duration,
) -> Result<(DeviceConnection, String)> {
    let ble = BleClient::new().await?;
    let conn = ble.connect(device, timeout).await?;
    let secret = match secret {
        Some(s) => s,
        None => conn.claim().await?,
    };
    if secret.is_empty() {
        bail!("设备没有有效租约 (已过期，等待设备重启)");
    }
    Ok((conn, secret))
}

async fn hold_loop(conn: &DeviceConnection, secret: &str, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                conn.hold(secret).await?;
                let status = conn.status().await?;
                tracing::debug!("hold ok, status={}", status);
                if status != "claimed" {
                    bail!("租约已丢失 (status={})", status);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn join(device: &str, interface: Option<&str>, timeout: Duration) -> Result<()> {
    let (conn, secret) = connect_with_secret(device, None, timeout).await?;
    let network = conn.request_network_identity(&secret, timeout).await?;
    conn.disconnect().await?;
    println!("📶 会话网络: {}", network);

    let nm = NmClient::new().await?;
    let wifi = nm
        .find_wifi_device(interface)
        .await?
        .context("未找到 WiFi 设备")?;
    let conn_path = nm.create_wifi_connection(&network, &secret, interface).await?;
    let active = nm.activate_connection(&conn_path.as_ref(), &wifi).await?;
    let ip = nm
        .wait_for_ip(&active.as_ref(), Duration::from_secs(30))
        .await?;
    println!("✅ 已加入 {} (IP: {})", network, ip);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = tracing_log::LogTracer::init();
    let default_filter = if cli.verbose {
        "info,bullsi_core=debug,bullsi_cli=debug"
    } else {
        "warn"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Discover => {
            println!("🔍 扫描设备 ({}s)...", cli.timeout);
            let devices = BleClient::new().await?.discover(timeout).await?;
            if devices.is_empty() {
                println!("   未发现设备");
            } else {
                for (i, dev) in devices.iter().enumerate() {
                    let rssi = dev.rssi.map_or_else(|| "?".to_string(), |r| r.to_string());
                    println!("   [{}] {} ({}, {} dBm)", i, dev.name, dev.address, rssi);
                }
            }
        }
        Commands::Claim { device } => {
            let conn = BleClient::new().await?.connect(&device, timeout).await?;
            let secret = conn.claim().await?;
            conn.disconnect().await?;
            if secret.is_empty() {
                println!("⚠️  设备没有有效租约");
            } else {
                println!("{}", secret);
            }
        }
        Commands::Status { device } => {
            let conn = BleClient::new().await?.connect(&device, timeout).await?;
            println!("状态: {}", conn.status().await?);
            conn.disconnect().await?;
        }
        Commands::Hold {
            device,
            secret,
            keep,
            interval_ms,
        } => {
            let (conn, secret) = connect_with_secret(&device, secret, timeout).await?;
            if keep {
                println!("🔒 保持租约中，按 Ctrl-C 结束");
                hold_loop(&conn, &secret, Duration::from_millis(interval_ms)).await?;
            } else {
                conn.hold(&secret).await?;
                println!("✅ 租约已刷新");
            }
            conn.disconnect().await?;
        }
        Commands::Identity { device, secret } => {
            let (conn, secret) = connect_with_secret(&device, secret, timeout).await?;
            let network = conn.request_network_identity(&secret, timeout).await?;
            conn.disconnect().await?;
            println!("{}", network);
        }
        Commands::Wipe { device, secret } => {
            let (conn, secret) = connect_with_secret(&device, secret, timeout).await?;
            conn.wipe(&secret).await?;
            // 设备重置后连接会断开
            let _ = conn.disconnect().await;
            println!("🧹 已发送重置请求");
        }
        Commands::Join { device, interface } => {
            join(&device, interface.as_deref(), timeout).await?;
        }
        Commands::Local { command } => {
            let request = match command {
                LocalCommands::Status => client::IpcRequest::Status,
                LocalCommands::Stop => client::IpcRequest::Stop,
            };
            if let client::IpcResponse::Status { snapshot } = client::send_request(request).await?
            {
                println!("状态: {}", snapshot.status);
                println!("网络: {} (信道 {})", snapshot.network_name, snapshot.channel);
                println!("过期窗口: {}ms", snapshot.expiration_ms);
                for sub in &snapshot.subscriptions {
                    println!("订阅: {} <- {}", sub.value.name(), sub.subscriber);
                }
            }
        }
    }

    Ok(())
}
