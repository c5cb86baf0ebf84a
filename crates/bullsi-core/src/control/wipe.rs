//! 设备重置

use std::process::Command;

use log::{error, info, warn};

/// 授权 wipe 后执行的重置动作
pub trait WipeHandler: Send {
    fn wipe(&mut self);
}

/// 执行外部命令完成重置
///
/// 未配置命令时只记录日志，由进程退出后的服务管理器负责重新拉起。
#[derive(Debug, Clone, Default)]
pub struct CommandWipe {
    argv: Vec<String>,
}

impl CommandWipe {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// 按空白拆分命令行
    pub fn from_command_line(line: Option<&str>) -> Self {
        Self::new(
            line.map(|l| l.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        )
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl WipeHandler for CommandWipe {
    fn wipe(&mut self) {
        let Some((program, args)) = self.argv.split_first() else {
            warn!("No wipe command configured, relying on restart");
            return;
        };

        info!("Running wipe command: {}", self.argv.join(" "));
        match Command::new(program).args(args).status() {
            Ok(status) if status.success() => info!("Wipe command finished"),
            Ok(status) => error!("Wipe command exited with {status}"),
            Err(e) => error!("Failed to run wipe command '{program}': {e}"),
        }
    }
}
