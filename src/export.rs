//! 追踪导出模块
//!
//! 把会话 JSONL 导出为 Markdown 对话稿或清理后的 JSON。

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde_json::{Value, json};

use crate::common::truncate_with_ellipsis;

/// export 子命令参数
#[derive(Debug, Parser)]
#[command(name = "tap-rs export", about = "导出追踪 JSONL 为 Markdown 或 JSON")]
pub struct ExportArgs {
    /// 追踪 .jsonl 文件路径
    pub trace_file: PathBuf,
    /// 输出文件路径（默认输出到 stdout）
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// 输出格式（默认按 -o 扩展名推断，否则 markdown）
    #[arg(long, value_enum)]
    pub format: Option<ExportFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Markdown,
    Json,
}

/// 执行导出
pub fn run(args: ExportArgs) -> Result<()> {
    if !args.trace_file.exists() {
        bail!("追踪文件不存在: {}", args.trace_file.display());
    }

    let content = fs::read_to_string(&args.trace_file)
        .with_context(|| format!("读取追踪文件失败: {}", args.trace_file.display()))?;
    let mut records: Vec<Value> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    if records.is_empty() {
        bail!("追踪文件中没有有效记录");
    }

    // 日志按完成顺序排列，导出按 turn（开始顺序）排列
    records.sort_by_key(|r| r.get("turn").and_then(Value::as_u64).unwrap_or(0));

    let format = args.format.unwrap_or_else(|| {
        match args.output.as_ref().and_then(|p| p.extension()) {
            Some(ext) if ext == "json" => ExportFormat::Json,
            _ => ExportFormat::Markdown,
        }
    });

    let output = match format {
        ExportFormat::Json => export_json(&records)?,
        ExportFormat::Markdown => export_markdown(&records),
    };

    match args.output {
        Some(path) => {
            fs::write(&path, output)
                .with_context(|| format!("写入导出文件失败: {}", path.display()))?;
            println!("已导出 {} 个 turn 到 {}", records.len(), path.display());
        }
        None => println!("{}", output),
    }
    Ok(())
}

fn usage_of(record: &Value) -> &Value {
    record
        .pointer("/response/body/usage")
        .unwrap_or(&Value::Null)
}

/// 导出为 Markdown 对话稿
fn export_markdown(records: &[Value]) -> String {
    let mut out = String::new();
    out.push_str("# Claude Trace Export\n\n");

    let mut total_input = 0u64;
    let mut total_output = 0u64;
    let mut total_cache_read = 0u64;
    let mut total_cache_create = 0u64;
    let mut models: std::collections::BTreeSet<String> = Default::default();

    for r in records {
        let usage = usage_of(r);
        let get = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        total_input += get("input_tokens");
        total_output += get("output_tokens");
        total_cache_read += get("cache_read_input_tokens");
        total_cache_create += get("cache_creation_input_tokens");
        if let Some(model) = r.pointer("/request/body/model").and_then(Value::as_str) {
            models.insert(model.to_string());
        }
    }

    out.push_str("## Summary\n\n");
    let _ = writeln!(out, "- **Turns**: {}", records.len());
    let models_str = if models.is_empty() {
        "unknown".to_string()
    } else {
        models.into_iter().collect::<Vec<_>>().join(", ")
    };
    let _ = writeln!(out, "- **Models**: {}", models_str);
    let _ = writeln!(out, "- **Input tokens**: {}", total_input);
    let _ = writeln!(out, "- **Output tokens**: {}", total_output);
    if total_cache_read > 0 {
        let _ = writeln!(out, "- **Cache read tokens**: {}", total_cache_read);
    }
    if total_cache_create > 0 {
        let _ = writeln!(out, "- **Cache create tokens**: {}", total_cache_create);
    }
    out.push('\n');

    for r in records {
        let turn = r.get("turn").and_then(Value::as_u64).unwrap_or(0);
        let model = r
            .pointer("/request/body/model")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let duration = r.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);

        let _ = writeln!(out, "---\n\n## Turn {}\n", turn);
        let _ = writeln!(out, "**Model**: `{}` | **Duration**: {}ms\n", model, duration);

        // 请求侧只展示最后一条消息（通常是本轮用户输入或工具结果）
        if let Some(messages) = r.pointer("/request/body/messages").and_then(Value::as_array) {
            if let Some(last) = messages.last() {
                let role = last.get("role").and_then(Value::as_str).unwrap_or("unknown");
                let _ = writeln!(out, "### {}\n", capitalize(role));
                render_request_content(&mut out, last.get("content"));
            }
        }

        if let Some(content) = r.pointer("/response/body/content").and_then(Value::as_array) {
            if !content.is_empty() {
                out.push_str("### Assistant\n\n");
                for block in content {
                    render_response_block(&mut out, block);
                }
            }
        }

        let usage = usage_of(r);
        let mut parts = Vec::new();
        for (key, label) in [
            ("input_tokens", "in"),
            ("output_tokens", "out"),
            ("cache_read_input_tokens", "cache_read"),
            ("cache_creation_input_tokens", "cache_create"),
        ] {
            if let Some(n) = usage.get(key).and_then(Value::as_u64) {
                if n > 0 {
                    parts.push(format!("{}={}", label, n));
                }
            }
        }
        if !parts.is_empty() {
            let _ = writeln!(out, "*Tokens: {}*\n", parts.join(" / "));
        }
    }

    out
}

fn render_request_content(out: &mut String, content: Option<&Value>) {
    match content {
        Some(Value::String(text)) => {
            let _ = writeln!(out, "{}\n", text);
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                        let _ = writeln!(out, "{}\n", text);
                    }
                    Some("tool_result") => {
                        let id = block.get("tool_use_id").and_then(Value::as_str).unwrap_or("");
                        let _ = writeln!(out, "**Tool Result** (`{}`)\n", id);
                        match block.get("content") {
                            Some(Value::String(rc)) => {
                                let _ = writeln!(out, "```\n{}\n```\n", truncate_with_ellipsis(rc, 2000));
                            }
                            Some(Value::Array(subs)) => {
                                for sub in subs {
                                    if sub.get("type").and_then(Value::as_str) == Some("text") {
                                        let text = sub.get("text").and_then(Value::as_str).unwrap_or("");
                                        let _ = writeln!(out, "```\n{}\n```\n", truncate_with_ellipsis(text, 2000));
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn render_response_block(out: &mut String, block: &Value) {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = block.get("text").and_then(Value::as_str).unwrap_or("");
            if !text.trim().is_empty() {
                let _ = writeln!(out, "{}\n", text);
            }
        }
        Some("tool_use") => {
            let name = block.get("name").and_then(Value::as_str).unwrap_or("unknown");
            let input = block.get("input").cloned().unwrap_or(json!({}));
            let rendered = serde_json::to_string_pretty(&input).unwrap_or_default();
            let _ = writeln!(out, "**Tool Use**: `{}`\n", name);
            let _ = writeln!(out, "```json\n{}\n```\n", truncate_with_ellipsis(&rendered, 3000));
        }
        Some("thinking") => {
            let thinking = block.get("thinking").and_then(Value::as_str).unwrap_or("");
            if !thinking.trim().is_empty() {
                let _ = writeln!(
                    out,
                    "<details>\n<summary>Thinking</summary>\n\n{}\n\n</details>\n",
                    truncate_with_ellipsis(thinking, 5000)
                );
            }
        }
        _ => {}
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// 导出为清理后的 JSON（只保留对话核心字段）
fn export_json(records: &[Value]) -> Result<String> {
    let cleaned: Vec<Value> = records
        .iter()
        .map(|r| {
            let mut entry = json!({
                "turn": r.get("turn"),
                "timestamp": r.get("timestamp"),
                "duration_ms": r.get("duration_ms"),
                "model": r.pointer("/request/body/model"),
                "messages": r.pointer("/request/body/messages").cloned().unwrap_or(json!([])),
                "response": {
                    "content": r.pointer("/response/body/content").cloned().unwrap_or(json!([])),
                    "usage": r.pointer("/response/body/usage").cloned().unwrap_or(json!({})),
                    "stop_reason": r.pointer("/response/body/stop_reason"),
                },
            });
            if let Some(system) = r.pointer("/request/body/system") {
                entry["system"] = system.clone();
            }
            if let Some(tools) = r.pointer("/request/body/tools") {
                entry["tools"] = tools.clone();
            }
            entry
        })
        .collect();

    serde_json::to_string_pretty(&cleaned).context("序列化导出 JSON 失败")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(turn: u64) -> String {
        json!({
            "timestamp": "2026-01-01T00:00:00Z",
            "request_id": format!("req_{:012}", turn),
            "turn": turn,
            "duration_ms": 100,
            "request": {
                "method": "POST",
                "path": "/v1/messages",
                "headers": {},
                "body": {
                    "model": "claude-sonnet-4-5",
                    "messages": [{"role": "user", "content": format!("question {}", turn)}],
                },
            },
            "response": {
                "status": 200,
                "headers": {},
                "body": {
                    "content": [{"type": "text", "text": format!("answer {}", turn)}],
                    "usage": {"input_tokens": 10, "output_tokens": 3},
                    "stop_reason": "end_turn",
                },
            },
        })
        .to_string()
    }

    /// Markdown 导出包含摘要与每轮内容，按 turn 排序
    #[test]
    fn test_markdown_export_sorted_by_turn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        // 写入顺序与 turn 顺序相反（模拟乱序完成）
        fs::write(&path, format!("{}\n{}\n", sample_record(2), sample_record(1))).unwrap();

        let out_path = dir.path().join("out.md");
        run(ExportArgs {
            trace_file: path,
            output: Some(out_path.clone()),
            format: Some(ExportFormat::Markdown),
        })
        .unwrap();

        let out = fs::read_to_string(&out_path).unwrap();
        assert!(out.contains("# Claude Trace Export"));
        assert!(out.contains("- **Turns**: 2"));
        assert!(out.contains("- **Input tokens**: 20"));
        let turn1 = out.find("## Turn 1").unwrap();
        let turn2 = out.find("## Turn 2").unwrap();
        assert!(turn1 < turn2);
        assert!(out.contains("answer 1"));
    }

    /// JSON 导出只保留核心字段
    #[test]
    fn test_json_export_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(&path, format!("{}\n", sample_record(1))).unwrap();

        let out_path = dir.path().join("out.json");
        run(ExportArgs {
            trace_file: path,
            output: Some(out_path.clone()),
            format: None, // 按扩展名推断为 json
        })
        .unwrap();

        let cleaned: Value = serde_json::from_str(&fs::read_to_string(&out_path).unwrap()).unwrap();
        assert_eq!(cleaned[0]["turn"], 1);
        assert_eq!(cleaned[0]["model"], "claude-sonnet-4-5");
        assert_eq!(cleaned[0]["response"]["usage"]["output_tokens"], 3);
        assert!(cleaned[0].get("request_id").is_none());
    }

    /// 无效行被跳过；全部无效时报错
    #[test]
    fn test_invalid_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(&path, format!("not json\n{}\n", sample_record(1))).unwrap();
        run(ExportArgs {
            trace_file: path.clone(),
            output: Some(dir.path().join("o.md")),
            format: Some(ExportFormat::Markdown),
        })
        .unwrap();

        fs::write(&path, "garbage\n").unwrap();
        let err = run(ExportArgs {
            trace_file: path,
            output: None,
            format: Some(ExportFormat::Markdown),
        });
        assert!(err.is_err());
    }

    /// 追踪文件缺失时报错
    #[test]
    fn test_missing_file_errors() {
        let err = run(ExportArgs {
            trace_file: PathBuf::from("/nonexistent/trace.jsonl"),
            output: None,
            format: None,
        });
        assert!(err.is_err());
    }
}
