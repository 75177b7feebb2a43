//! 追踪记录的 JSONL 写入与会话统计
//!
//! 单写者纪律：所有记录经由同一把锁追加到打开的日志句柄，
//! 并发完成的交换不会在行中间交织。落盘成功后才广播给实时订阅端。

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::live::LiveHub;

use super::model::TraceRecord;

/// 会话级运行统计
#[derive(Debug, Clone, Default)]
pub struct TraceStats {
    pub api_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_create_tokens: u64,
    /// 模型名 -> 调用次数
    pub models_used: BTreeMap<String, u64>,
}

/// JSONL 追加写入器
///
/// 日志句柄由写入器独占；其他组件只能通过 `write` 接口触达。
pub struct TraceWriter {
    file: Mutex<File>,
    stats: parking_lot::Mutex<TraceStats>,
    hub: Option<Arc<LiveHub>>,
}

impl TraceWriter {
    /// 打开（必要时创建）追踪文件；失败属于启动致命错误
    pub fn create(path: &Path, hub: Option<Arc<LiveHub>>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建追踪目录失败: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("打开追踪文件失败: {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            stats: parking_lot::Mutex::new(TraceStats::default()),
            hub,
        })
    }

    /// 追加一条记录：序列化、整行写入并 flush、持锁广播、更新统计
    ///
    /// 写盘失败只影响本次调用方，已写入的行不受影响。
    pub async fn write(&self, record: &TraceRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("序列化追踪记录失败")?;

        {
            let mut file = self.file.lock().await;
            file.write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.flush())
                .context("写入追踪记录失败")?;

            // 持文件锁发布：广播顺序必须等于追加顺序
            if let Some(hub) = &self.hub {
                hub.publish(Arc::from(line.as_str()));
            }
        }

        self.update_stats(record);
        Ok(())
    }

    fn update_stats(&self, record: &TraceRecord) {
        let usage = record.usage();
        let mut stats = self.stats.lock();
        stats.api_calls += 1;
        stats.input_tokens += usage.input_tokens;
        stats.output_tokens += usage.output_tokens;
        stats.cache_read_tokens += usage.cache_read_tokens;
        stats.cache_create_tokens += usage.cache_create_tokens;
        *stats.models_used.entry(record.model().to_string()).or_insert(0) += 1;
    }

    /// 会话统计快照
    pub fn summary(&self) -> TraceStats {
        self.stats.lock().clone()
    }

    /// flush 日志句柄；可重复调用
    pub async fn close(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().context("flush 追踪文件失败")?;
        Ok(())
    }
}
