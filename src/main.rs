//! tap-rs 入口
//!
//! 在 claude 子进程与上游 API 之间插入本地观测代理：
//! 转发不加延迟，完整记录每次交换，结束时生成静态查看器。

mod common;
mod export;
mod launcher;
mod live;
mod manifest;
mod model;
mod proxy;
mod sse;
mod trace;
mod viewer;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::launcher::Finalizer;
use crate::live::LiveServer;
use crate::model::Config;
use crate::model::config::{default_host, default_max_traces, default_output_dir, default_target};
use crate::proxy::{ProxyState, build_client, create_proxy_router};
use crate::trace::{SessionPaths, TraceSession};

/// 主命令参数：tap 自身的选项都带 --tap- 前缀，其余原样透传给 claude
#[derive(Debug, Parser)]
#[command(
    name = "tap-rs",
    about = "记录 Claude Code 与 API 之间全部流量的本地观测代理",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct TapArgs {
    /// 追踪输出目录
    #[arg(long = "tap-output-dir", default_value_os_t = default_output_dir())]
    output_dir: PathBuf,
    /// 代理监听端口（默认自动分配）
    #[arg(long = "tap-port", default_value_t = 0)]
    port: u16,
    /// 上游 API 基地址
    #[arg(long = "tap-target", default_value_t = default_target())]
    target: String,
    /// 只起代理，不启动 claude 子进程
    #[arg(long = "tap-no-launch")]
    no_launch: bool,
    /// 启动实时查看服务
    #[arg(long = "tap-live")]
    live: bool,
    /// 实时查看服务端口（默认自动分配）
    #[arg(long = "tap-live-port", default_value_t = 0)]
    live_port: u16,
    /// 输出目录保留的最大会话数（0 表示不限制）
    #[arg(long = "tap-max-traces", default_value_t = default_max_traces())]
    max_traces: usize,
    /// 透传给 claude 的参数（含 --help 等）
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    claude_args: Vec<String>,
}

impl TapArgs {
    fn into_config(self) -> Config {
        Config {
            host: default_host(),
            port: self.port,
            target: self.target,
            output_dir: self.output_dir,
            live: self.live,
            live_port: self.live_port,
            max_traces: self.max_traces,
            no_launch: self.no_launch,
            claude_args: self.claude_args,
        }
    }
}

#[tokio::main]
async fn main() {
    // export 子命令不走代理路径，手动分流避免与透传参数冲突
    let mut argv: Vec<String> = std::env::args().collect();
    if argv.get(1).map(String::as_str) == Some("export") {
        argv.remove(1);
        let args = export::ExportArgs::parse_from(argv);
        if let Err(e) = export::run(args) {
            eprintln!("导出失败: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = TapArgs::parse().into_config();
    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("启动失败: {:#}", e);
            2
        }
    };
    std::process::exit(code.clamp(0, 255));
}

/// 启动顺序：会话文件 → 日志 → 实时服务 → 监听器绑定 → 子进程
///
/// 监听器绑定失败必须发生在子进程启动之前，此时直接返回错误（退出码 2）。
async fn run(config: Config) -> Result<i32> {
    let paths = SessionPaths::prepare(&config.output_dir)?;
    init_logging(&paths)?;

    let live_server = if config.live {
        Some(LiveServer::start(config.live_port, paths.trace_path.clone()).await?)
    } else {
        None
    };
    let hub = live_server.as_ref().map(|s| s.hub.clone());

    let session = TraceSession::open(paths, hub)?;
    let writer = session.writer.clone();

    let client = build_client(30)?;
    let state = ProxyState::new(client, config.normalized_target(), writer.clone());
    let app = create_proxy_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("代理绑定 {}:{} 失败", config.host, config.port))?;
    let addr = listener.local_addr().context("获取代理监听地址失败")?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("代理服务退出: {}", e);
        }
    });

    println!("🔍 tap-rs 代理监听: http://{}  →  {}", addr, config.normalized_target());
    println!("📁 追踪文件: {}", session.paths.trace_path.display());
    if let Some(server) = &live_server {
        println!("🌐 实时查看: {}", server.url());
    }

    let child_result = if config.no_launch {
        launcher::wait_for_interrupt().await;
        Ok(0)
    } else {
        launcher::run_child(addr.port(), &config.claude_args).await
    };

    // 子进程侧的内部故障同样先走收尾，再向上冒泡
    let finalizer = Finalizer::new();
    finalize(&finalizer, &config, &session, live_server.as_ref()).await;
    child_result
}

/// 一次性收尾：冲刷日志、生成查看器、登记并清理输出目录
///
/// 收尾失败只告警不改变退出码，追踪 JSONL 此时已落盘。
async fn finalize(
    finalizer: &Finalizer,
    config: &Config,
    session: &TraceSession,
    live_server: Option<&LiveServer>,
) {
    if !finalizer.begin() {
        return;
    }
    let _absorb = launcher::absorb_interrupts();

    if let Some(server) = live_server {
        server.stop();
    }
    if let Err(e) = session.writer.close().await {
        tracing::warn!("冲刷追踪文件失败: {}", e);
    }

    let paths = &session.paths;
    match viewer::generate(&paths.trace_path, &paths.html_path) {
        Ok(count) => println!("\n📄 查看器已生成: {} ({} 条记录)", paths.html_path.display(), count),
        Err(e) => tracing::warn!("生成查看器失败: {}", e),
    }

    let files: Vec<String> = [&paths.trace_path, &paths.log_path, &paths.html_path]
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    if let Err(e) = manifest::register(&config.output_dir, &paths.stamp, files) {
        tracing::warn!("登记会话清单失败: {}", e);
    }
    match manifest::cleanup(&config.output_dir, config.max_traces) {
        Ok(0) => {}
        Ok(n) => println!("🧹 已清理 {} 个旧会话", n),
        Err(e) => tracing::warn!("清理旧会话失败: {}", e),
    }

    print_summary(session);
    finalizer.complete();
}

fn print_summary(session: &TraceSession) {
    let stats = session.writer.summary();
    println!("\n📊 会话摘要");
    println!("   API 调用: {}", stats.api_calls);
    println!(
        "   Tokens: in={} out={} cache_read={} cache_create={}",
        stats.input_tokens, stats.output_tokens, stats.cache_read_tokens, stats.cache_create_tokens
    );
    for (model, count) in &stats.models_used {
        println!("   模型 {}: {} 次", model, count);
    }
    println!("   追踪: {}", session.paths.trace_path.display());
    println!("   查看器: {}", session.paths.html_path.display());
}

/// 日志写到会话 .log 文件，终端留给子进程的交互界面
fn init_logging(paths: &SessionPaths) -> Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_path)
        .with_context(|| format!("打开日志文件失败: {}", paths.log_path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{RequestSnapshot, ResponseSnapshot, TraceRecord};
    use serde_json::json;

    fn sample_record() -> TraceRecord {
        TraceRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: TraceRecord::new_request_id(),
            turn: 1,
            duration_ms: 5,
            request: RequestSnapshot {
                method: "POST".into(),
                path: "/v1/messages".into(),
                headers: serde_json::Map::new(),
                body: json!({"model": "claude-sonnet-4-5"}),
            },
            response: ResponseSnapshot {
                status: 200,
                headers: serde_json::Map::new(),
                body: json!({"usage": {"input_tokens": 1, "output_tokens": 1}}),
                sse_events: None,
                partial: None,
                parse_errors: 0,
            },
        }
    }

    /// 收尾恰好一次：冲刷日志、生成查看器、登记清单；重复触发是空操作
    #[tokio::test]
    async fn test_finalize_runs_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let paths = SessionPaths::prepare(&config.output_dir).unwrap();
        let session = TraceSession::open(paths, None).unwrap();
        session.writer.write(&sample_record()).await.unwrap();

        let finalizer = Finalizer::new();
        finalize(&finalizer, &config, &session, None).await;

        assert!(finalizer.is_finalized());
        assert!(session.paths.html_path.exists());
        let html = std::fs::read_to_string(&session.paths.html_path).unwrap();
        assert!(html.contains("claude-sonnet-4-5"));
        assert!(dir.path().join(".tap-manifest.json").exists());

        // 重复触发不会重新生成产物
        std::fs::remove_file(&session.paths.html_path).unwrap();
        finalize(&finalizer, &config, &session, None).await;
        assert!(!session.paths.html_path.exists());
    }
}
