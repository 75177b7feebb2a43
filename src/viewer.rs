//! 静态查看器生成模块
//!
//! 会话结束时把完整 JSONL 嵌入内置 HTML 模板，产出单文件静态文档；
//! 实时模式下同一模板以 LIVE_MODE 注入。模板内部的渲染逻辑属于
//! 查看器组件，这里只负责注入契约。

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

/// 模板主脚本的注入锚点
const SPLICE_MARKER: &str = "<script>\nconst $ = s =>";

fn template() -> Result<String> {
    let file = Assets::get("viewer.html").context("内置模板 viewer.html 缺失")?;
    Ok(String::from_utf8_lossy(file.data.as_ref()).into_owned())
}

/// 在主脚本前注入数据脚本
fn splice(html: &str, data_js: &str) -> Result<String> {
    if !html.contains(SPLICE_MARKER) {
        bail!("模板缺少注入锚点");
    }
    Ok(html.replacen(
        SPLICE_MARKER,
        &format!("<script>\n{}</script>\n{}", data_js, SPLICE_MARKER),
        1,
    ))
}

fn path_constants(trace_path: &Path, html_path: &Path) -> String {
    format!(
        "const __TRACE_JSONL_PATH__ = {};\nconst __TRACE_HTML_PATH__ = {};\n",
        serde_json::Value::String(trace_path.display().to_string()),
        serde_json::Value::String(html_path.display().to_string()),
    )
}

/// 从已冲刷的 JSONL 生成自包含 HTML，返回嵌入的记录条数
///
/// 每行本身已是合法 JSON，直接拼接为数组字面量。
pub fn generate(trace_path: &Path, html_path: &Path) -> Result<usize> {
    let content = fs::read_to_string(trace_path)
        .with_context(|| format!("读取追踪文件失败: {}", trace_path.display()))?;
    let records: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let data_js = format!(
        "const EMBEDDED_TRACE_DATA = [\n{}\n];\n{}",
        records.join(",\n"),
        path_constants(trace_path, html_path),
    );

    let html = splice(&template()?, &data_js)?;
    fs::write(html_path, html)
        .with_context(|| format!("写入查看器文件失败: {}", html_path.display()))?;
    Ok(records.len())
}

/// 实时模式页面：空数据数组 + LIVE_MODE 标记
pub fn render_live_page(trace_path: &Path) -> Result<String> {
    let html_path = trace_path.with_extension("html");
    let data_js = format!(
        "const LIVE_MODE = true;\nconst EMBEDDED_TRACE_DATA = [];\n{}",
        path_constants(trace_path, &html_path),
    );
    splice(&template()?, &data_js)
}
