//! 追踪会话模块
//!
//! 记录模型、JSONL 写入器与会话上下文。

pub mod model;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;

use crate::live::LiveHub;

pub use model::{RequestSnapshot, ResponseSnapshot, TokenUsage, TraceRecord};
pub use writer::{TraceStats, TraceWriter};

/// 会话文件路径集合（日志句柄打开之前即可确定，实时服务需要）
#[derive(Debug, Clone)]
pub struct SessionPaths {
    /// 会话时间戳（用于文件命名与清单登记）
    pub stamp: String,
    pub trace_path: PathBuf,
    pub log_path: PathBuf,
    pub html_path: PathBuf,
}

impl SessionPaths {
    /// 在输出目录下规划带时间戳的会话文件
    pub fn prepare(output_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("创建输出目录失败: {}", output_dir.display()))?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        Ok(Self {
            trace_path: output_dir.join(format!("trace_{}.jsonl", stamp)),
            log_path: output_dir.join(format!("trace_{}.log", stamp)),
            html_path: output_dir.join(format!("trace_{}.html", stamp)),
            stamp,
        })
    }
}

/// 进程级追踪会话上下文
///
/// 进程启动时构造一次；日志句柄由内部写入器独占，进程结束时
/// 恰好关闭/冲刷一次（由 launcher 的 Finalizer 保证）。
pub struct TraceSession {
    pub paths: SessionPaths,
    pub writer: Arc<TraceWriter>,
}

impl TraceSession {
    /// 打开会话：创建追踪文件并接上可选的广播中心
    ///
    /// 打开失败属于启动致命错误，必须发生在子进程启动之前。
    pub fn open(paths: SessionPaths, hub: Option<Arc<LiveHub>>) -> Result<Self> {
        let writer = Arc::new(TraceWriter::create(&paths.trace_path, hub)?);
        Ok(Self { paths, writer })
    }
}
