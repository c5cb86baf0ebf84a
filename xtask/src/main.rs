use anyhow::Result;
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Bullsi 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建所有组件 (release)
    Build,
    /// 运行守护进程 (开发模式)
    Dev {
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "debug")]
        log_level: String,
        /// 租约过期窗口 (ms)，0 表示永不过期
        #[arg(long)]
        expiration_ms: Option<u64>,
    },
    /// 安装 systemd 服务
    Install,
    /// 卸载 systemd 服务
    Uninstall,
    /// 运行测试
    Test,
    /// 清理构建产物
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = match std::env::var("CARGO_MANIFEST_DIR")
        .map(std::path::PathBuf::from)
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
    {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Dev {
            log_level,
            expiration_ms,
        } => dev(&sh, &log_level, expiration_ms)?,
        Commands::Install => install(&sh)?,
        Commands::Uninstall => uninstall(&sh)?,
        Commands::Test => test(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建所有组件...");
    cmd!(sh, "cargo build --release -p bullsi-daemon -p bullsi-cli").run()?;
    println!("✅ 构建完成");
    Ok(())
}

fn dev(sh: &Shell, log_level: &str, expiration_ms: Option<u64>) -> Result<()> {
    println!("🚀 启动开发模式守护进程...");
    let mut args = vec!["--log-level".to_string(), log_level.to_string()];
    if let Some(ms) = expiration_ms {
        args.push("--expiration-ms".to_string());
        args.push(ms.to_string());
    }
    cmd!(sh, "cargo run -p bullsi-daemon -- {args...}").run()?;
    Ok(())
}

fn install(sh: &Shell) -> Result<()> {
    println!("📦 安装 Bullsi 服务...");

    build(sh)?;

    // 先停止已运行的服务（如果存在）
    println!("⏹️  停止现有服务...");
    let _ = cmd!(sh, "sudo systemctl stop bullsi.service").run();

    // 等待进程完全退出
    std::thread::sleep(std::time::Duration::from_millis(500));

    println!("📋 复制二进制文件...");
    cmd!(sh, "sudo cp target/release/bullsi-daemon /usr/local/bin/").run()?;
    cmd!(sh, "sudo cp target/release/bullsi-cli /usr/local/bin/bullsi").run()?;

    cmd!(sh, "sudo cp assets/bullsi.service /etc/systemd/system/").run()?;

    cmd!(sh, "sudo systemctl daemon-reload").run()?;
    cmd!(sh, "sudo systemctl enable --now bullsi.service").run()?;

    println!("✅ 服务安装完成");
    println!("   使用 'bullsi --help' 查看命令");
    println!("   使用 'systemctl status bullsi' 查看服务状态");
    Ok(())
}

fn uninstall(sh: &Shell) -> Result<()> {
    println!("🗑️  卸载 Bullsi 服务...");

    let _ = cmd!(sh, "sudo systemctl stop bullsi.service").run();
    let _ = cmd!(sh, "sudo systemctl disable bullsi.service").run();

    let _ = cmd!(sh, "sudo rm /etc/systemd/system/bullsi.service").run();
    let _ = cmd!(sh, "sudo rm /usr/local/bin/bullsi-daemon").run();
    let _ = cmd!(sh, "sudo rm /usr/local/bin/bullsi").run();

    cmd!(sh, "sudo systemctl daemon-reload").run()?;

    println!("✅ 卸载完成");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 测试完成");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    println!("✅ 清理完成");
    Ok(())
}
