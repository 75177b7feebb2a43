//! 会话清单与旧追踪清理
//!
//! 输出目录下维护 .tap-manifest.json，登记每个会话产出的文件；
//! 超出保留上限时按时间戳删除最旧的会话文件。

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

const MANIFEST_FILE: &str = ".tap-manifest.json";

/// 一个会话的清单条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: String,
    pub files: Vec<String>,
    pub created_at: String,
}

/// 清单文件
#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    /// 归属标记：防止误把同名外部文件当成自己的清单
    #[serde(rename = "_tap", default)]
    tap: bool,
    pub version: String,
    #[serde(default)]
    pub traces: Vec<TraceEntry>,
}

impl Manifest {
    fn new() -> Self {
        Self {
            tap: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            traces: Vec::new(),
        }
    }
}

fn load_or_init(output_dir: &Path) -> Manifest {
    let path = output_dir.join(MANIFEST_FILE);
    if let Ok(content) = fs::read_to_string(&path) {
        if let Ok(manifest) = serde_json::from_str::<Manifest>(&content) {
            if manifest.tap {
                return manifest;
            }
        }
    }
    let mut manifest = Manifest::new();
    migrate_existing(output_dir, &mut manifest);
    manifest
}

fn save(output_dir: &Path, manifest: &Manifest) -> Result<()> {
    let path = output_dir.join(MANIFEST_FILE);
    let content = serde_json::to_string_pretty(manifest).context("序列化清单失败")?;
    fs::write(&path, content + "\n")
        .with_context(|| format!("写入清单失败: {}", path.display()))?;
    Ok(())
}

/// 把清单之外已存在的 trace_*.jsonl 会话自动登记进来
fn migrate_existing(output_dir: &Path, manifest: &mut Manifest) {
    let known: std::collections::HashSet<String> = manifest
        .traces
        .iter()
        .flat_map(|e| e.files.iter().cloned())
        .collect();

    let entries = match fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut found: Vec<std::path::PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "jsonl")
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("trace_"))
        })
        .collect();
    found.sort();

    for jsonl in found {
        let name = match jsonl.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if known.contains(&name) {
            continue;
        }
        let stamp = name
            .trim_start_matches("trace_")
            .trim_end_matches(".jsonl")
            .to_string();
        let mut files = vec![name];
        for ext in ["log", "html"] {
            let companion = jsonl.with_extension(ext);
            if companion.exists() {
                if let Some(n) = companion.file_name().and_then(|n| n.to_str()) {
                    files.push(n.to_string());
                }
            }
        }
        manifest.traces.push(TraceEntry {
            timestamp: stamp,
            files,
            created_at: Utc::now().to_rfc3339(),
        });
    }
}

/// 登记一个新会话
pub fn register(output_dir: &Path, stamp: &str, files: Vec<String>) -> Result<()> {
    let mut manifest = load_or_init(output_dir);
    // 迁移可能已把本会话的落盘文件登记进来，按时间戳去重
    manifest.traces.retain(|e| e.timestamp != stamp);
    manifest.traces.push(TraceEntry {
        timestamp: stamp.to_string(),
        files,
        created_at: Utc::now().to_rfc3339(),
    });
    save(output_dir, &manifest)
}

/// 删除超出保留上限的最旧会话，返回删除的会话数（max 为 0 表示不限制）
pub fn cleanup(output_dir: &Path, max_traces: usize) -> Result<usize> {
    if max_traces == 0 {
        return Ok(0);
    }
    let mut manifest = load_or_init(output_dir);
    if manifest.traces.len() <= max_traces {
        save(output_dir, &manifest)?;
        return Ok(0);
    }
    manifest.traces.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    let excess = manifest.traces.len() - max_traces;
    let removed: Vec<TraceEntry> = manifest.traces.drain(..excess).collect();
    for entry in &removed {
        for name in &entry.files {
            let path = output_dir.join(name);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("删除旧追踪文件失败 {}: {}", path.display(), e);
                }
            }
        }
    }
    save(output_dir, &manifest)?;
    Ok(removed.len())
}
