//! 子进程启动与一次性收尾协调
//!
//! 监听器先绑定、子进程后启动；中断信号转发给子进程让其走自身的
//! 退出路径；收尾（冲刷日志 + 生成静态查看器）在任何退出路径上
//! 恰好执行一次。

use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

/// 收到中断后等待子进程自行退出的宽限时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const RUNNING: u8 = 0;
const FINALIZING: u8 = 1;
const FINALIZED: u8 = 2;

/// 一次性收尾状态机：{running, finalizing, finalized}
///
/// 任何终止触发（正常退出、中断、内部故障）只会把 running 推进到
/// finalizing 一次；收尾进行中的重复触发是空操作。
pub struct Finalizer {
    state: AtomicU8,
}

impl Finalizer {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
        }
    }

    /// 尝试进入收尾阶段；只有第一次调用返回 true
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, FINALIZING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 收尾完成
    pub fn complete(&self) {
        self.state.store(FINALIZED, Ordering::SeqCst);
    }

    pub fn is_finalized(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FINALIZED
    }
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// 把 SIGINT 转发给子进程，让其执行自己的关闭路径
fn forward_interrupt(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: 向已知存活的子进程号发送信号
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// 启动 claude 子进程并等待退出，返回其退出码
///
/// 环境契约：ANTHROPIC_BASE_URL 指向本地监听器；NO_PROXY 保证回环
/// 直连；移除嵌套检测变量。其余参数原样透传给 claude。
pub async fn run_child(port: u16, extra_args: &[String]) -> Result<i32> {
    let mut cmd = Command::new("claude");
    cmd.args(extra_args)
        .env("ANTHROPIC_BASE_URL", format!("http://127.0.0.1:{}", port))
        .env("NO_PROXY", "127.0.0.1")
        .env_remove("CLAUDECODE")
        .env_remove("CLAUDE_CODE_SSE_PORT")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    println!("\n🚀 启动 Claude Code: claude {}", extra_args.join(" "));
    println!("   ANTHROPIC_BASE_URL=http://127.0.0.1:{}\n", port);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!(
                "\n错误: PATH 中找不到 'claude' 命令。\n\
                 请先安装 Claude Code: https://docs.anthropic.com/en/docs/claude-code\n"
            );
            return Ok(1);
        }
        Err(e) => return Err(e).context("启动 claude 子进程失败"),
    };
    let pid = child.id();

    let status = tokio::select! {
        status = child.wait() => status.context("等待子进程失败")?,
        _ = tokio::signal::ctrl_c() => {
            // 转发中断并在有限宽限内等待子进程自行退出
            tracing::info!("收到中断，转发给子进程 (pid={:?})", pid);
            forward_interrupt(pid);
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => status.context("等待子进程失败")?,
                Err(_) => {
                    tracing::warn!("子进程宽限期内未退出，强制终止");
                    child.kill().await.context("强制终止子进程失败")?;
                    child.wait().await.context("等待子进程失败")?
                }
            }
        }
    };

    let code = status.code().unwrap_or(130);
    println!("\n📋 Claude Code 退出，退出码 {}", code);
    Ok(code)
}

/// --no-launch 模式：代理常驻直到收到中断
pub async fn wait_for_interrupt() {
    println!("\n--no-launch 模式: 代理运行中，Ctrl+C 停止。");
    let _ = tokio::signal::ctrl_c().await;
}

/// 收尾窗口内吞掉后续中断，保证收尾不被打断
pub fn absorb_interrupts() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("收尾进行中，忽略重复中断");
        }
    })
}
