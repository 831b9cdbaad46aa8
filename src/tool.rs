use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// 外部命令行工具的失败原因
#[derive(Debug)]
pub enum ToolFailure {
    /// 进程无法启动（未安装、权限不足等）
    Spawn(std::io::Error),
    /// 超时，子进程已被终止
    Timeout(Duration),
    /// 非零退出码，附带 stderr 末尾几行（只用于日志）
    Exit { code: Option<i32>, stderr_tail: String },
}

impl ToolFailure {
    /// 给调用方的简短诊断，不包含工具原始输出
    pub fn summary(&self) -> String {
        match self {
            ToolFailure::Spawn(e) => format!("无法启动外部工具: {}", e.kind()),
            ToolFailure::Timeout(limit) => format!("执行超时 ({}s)", limit.as_secs()),
            ToolFailure::Exit { code: Some(code), .. } => format!("退出码 {}", code),
            ToolFailure::Exit { code: None, .. } => "被信号终止".to_string(),
        }
    }
}

/// 运行外部工具并收集输出；`limit` 为 None 时不设超时
///
/// 超时后 future 被丢弃，`kill_on_drop` 会终止子进程。
pub async fn run_tool(mut command: Command, limit: Option<Duration>) -> Result<Output, ToolFailure> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match limit {
        Some(limit) => tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| ToolFailure::Timeout(limit))?,
        None => command.output().await,
    }
    .map_err(ToolFailure::Spawn)?;

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr_tail = stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        debug!("外部工具失败: status={:?}, stderr={}", output.status, stderr_tail);
        Err(ToolFailure::Exit {
            code: output.status.code(),
            stderr_tail,
        })
    }
}
