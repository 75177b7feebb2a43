//! SSE 流重组模块
//!
//! 将上游返回的 SSE 字节流解析为离散事件，并按到达顺序累积出
//! 与非流式响应等价的完整消息快照。解析结果与分块边界无关：
//! 同一字节序列无论如何切分，重组输出完全一致。

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// 已知的 Anthropic 流式事件类型（未知类型保留原样但不参与重组）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SseEventKind {
    MessageStart,
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    MessageDelta,
    MessageStop,
    Unknown,
}

impl SseEventKind {
    fn parse(name: &str) -> Self {
        match name {
            "message_start" => Self::MessageStart,
            "content_block_start" => Self::ContentBlockStart,
            "content_block_delta" => Self::ContentBlockDelta,
            "content_block_stop" => Self::ContentBlockStop,
            "message_delta" => Self::MessageDelta,
            "message_stop" => Self::MessageStop,
            _ => Self::Unknown,
        }
    }
}

/// 单个解码后的 SSE 事件（到达顺序即列表下标）
#[derive(Debug, Clone, Serialize)]
pub struct SseEvent {
    pub event: String,
    pub data: Value,
}

/// SSE 重组器
///
/// `feed` 只做解析，不拷贝、不修改转发路径上的字节；
/// 调用方负责先转发原始 chunk，再把同一 chunk 喂进来。
pub struct SseReassembler {
    /// 按到达顺序保存的全部事件（含未知类型）
    events: Vec<SseEvent>,
    buf: BytesMut,
    current_event: Option<String>,
    current_data: Vec<String>,
    snapshot: Option<Value>,
    /// 每个内容块的 input_json_delta 片段缓冲，块关闭时整体解析
    json_fragments: HashMap<usize, String>,
    parse_errors: u32,
    /// 出现致命解析错误（如乱序块下标）后停止快照累积
    poisoned: bool,
    /// 是否收到 message_stop 终止事件
    terminated: bool,
}

impl SseReassembler {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            buf: BytesMut::new(),
            current_event: None,
            current_data: Vec::new(),
            snapshot: None,
            json_fragments: HashMap::new(),
            parse_errors: 0,
            poisoned: false,
            terminated: false,
        }
    }

    /// 喂入一个原始字节 chunk，解析其中完整的行
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]).into_owned();
            self.feed_line(line.trim_end_matches('\r'));
        }
    }

    /// 流结束：处理残留的未换行字节和未终结的事件块
    ///
    /// 未终结块仅在格式完好（有事件名且 data 可解析）时作为最终事件
    /// 发出，否则丢弃并计入解析错误；缺少 message_stop 不影响快照，
    /// 由调用方按部分结果持久化。
    pub fn finish(&mut self) {
        if !self.buf.is_empty() {
            let rest = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            self.feed_line(rest.trim_end_matches('\r'));
        }
        if self.current_event.is_some() {
            let raw = self.current_data.join("\n");
            let well_formed = raw.is_empty() || serde_json::from_str::<Value>(&raw).is_ok();
            if well_formed {
                self.dispatch_block();
            } else {
                self.parse_errors += 1;
                self.current_event = None;
                self.current_data.clear();
            }
        } else if !self.current_data.is_empty() {
            // 只有 data 没有事件名的残块
            self.parse_errors += 1;
            self.current_data.clear();
        }
    }

    fn feed_line(&mut self, line: &str) {
        if let Some(name) = line.strip_prefix("event:") {
            self.current_event = Some(name.trim().to_string());
            self.current_data.clear();
        } else if let Some(data) = line.strip_prefix("data:") {
            self.current_data.push(data.trim().to_string());
        } else if line.is_empty() {
            if self.current_event.is_some() {
                self.dispatch_block();
            } else if !self.current_data.is_empty() {
                // 事件名缺失的数据块：丢弃并计错，不影响转发
                self.parse_errors += 1;
                self.current_data.clear();
            }
        }
        // id: / retry: / 注释行不参与重组
    }

    fn dispatch_block(&mut self) {
        let name = match self.current_event.take() {
            Some(name) => name,
            None => return,
        };
        let raw = self.current_data.join("\n");
        self.current_data.clear();

        // data 不是合法 JSON 时按字符串保留
        let data: Value = serde_json::from_str(&raw)
            .unwrap_or_else(|_| Value::String(raw));

        let kind = SseEventKind::parse(&name);
        self.accumulate(kind, &data);
        self.events.push(SseEvent { event: name, data });
    }

    /// 按严格到达顺序把事件合并进消息快照
    fn accumulate(&mut self, kind: SseEventKind, data: &Value) {
        let obj = match data.as_object() {
            Some(obj) => obj,
            None => return,
        };

        if kind == SseEventKind::MessageStart {
            self.snapshot = Some(
                obj.get("message")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            );
            return;
        }
        if self.snapshot.is_none() || self.poisoned {
            return;
        }

        match kind {
            SseEventKind::MessageStart => unreachable!(),
            SseEventKind::ContentBlockStart => {
                let block = obj
                    .get("content_block")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                let content = match self.content_mut() {
                    Some(content) => content,
                    None => return,
                };
                let idx = obj
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|i| i as usize)
                    .unwrap_or(content.len());
                if idx > content.len() {
                    // 乱序块下标：该次交换的致命解析错误，快照保持现状
                    self.parse_errors += 1;
                    self.poisoned = true;
                    return;
                }
                if idx == content.len() {
                    content.push(block);
                } else {
                    content[idx] = block;
                }
            }
            SseEventKind::ContentBlockDelta => {
                let idx = obj.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let delta = obj.get("delta").cloned().unwrap_or(Value::Null);
                let content = match self.content_mut() {
                    Some(content) => content,
                    None => return,
                };
                if idx >= content.len() {
                    self.parse_errors += 1;
                    return;
                }
                let block = &mut content[idx];
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        append_str_field(block, "text", delta.get("text"));
                    }
                    Some("thinking_delta") => {
                        append_str_field(block, "thinking", delta.get("thinking"));
                    }
                    Some("input_json_delta") => {
                        if let Some(part) = delta.get("partial_json").and_then(Value::as_str) {
                            self.json_fragments.entry(idx).or_default().push_str(part);
                        }
                    }
                    _ => {}
                }
            }
            SseEventKind::ContentBlockStop => {
                let idx = obj.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(fragment) = self.json_fragments.remove(&idx) {
                    match serde_json::from_str::<Value>(&fragment) {
                        Ok(input) => {
                            if let Some(content) = self.content_mut() {
                                if idx < content.len() {
                                    if let Some(block) = content[idx].as_object_mut() {
                                        block.insert("input".to_string(), input);
                                    }
                                }
                            }
                        }
                        Err(_) => self.parse_errors += 1,
                    }
                }
            }
            SseEventKind::MessageDelta => {
                let snapshot = self.snapshot.as_mut().and_then(Value::as_object_mut);
                let snapshot = match snapshot {
                    Some(s) => s,
                    None => return,
                };
                if let Some(delta) = obj.get("delta").and_then(Value::as_object) {
                    for (k, v) in delta {
                        snapshot.insert(k.clone(), v.clone());
                    }
                }
                if let Some(usage) = obj.get("usage").and_then(Value::as_object) {
                    let entry = snapshot
                        .entry("usage".to_string())
                        .or_insert_with(|| Value::Object(Default::default()));
                    if let Some(entry) = entry.as_object_mut() {
                        for (k, v) in usage {
                            entry.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            SseEventKind::MessageStop => {
                self.terminated = true;
            }
            SseEventKind::Unknown => {}
        }
    }

    /// 取快照的 content 数组（不存在时创建；快照不是对象时返回 None）
    fn content_mut(&mut self) -> Option<&mut Vec<Value>> {
        let snapshot = self.snapshot.as_mut().and_then(Value::as_object_mut)?;
        snapshot
            .entry("content".to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
    }

    /// 重组出的完整消息快照（未收到 message_start 时为 None）
    pub fn reconstruct(&self) -> Option<&Value> {
        self.snapshot.as_ref()
    }

    /// 累计的解析错误数
    pub fn parse_errors(&self) -> u32 {
        self.parse_errors
    }

    /// 是否收到终止事件且无解析错误
    pub fn is_complete(&self) -> bool {
        self.terminated && self.parse_errors == 0
    }

    /// 拆出事件列表与快照，供记录构建使用
    pub fn into_parts(self) -> (Vec<SseEvent>, Option<Value>, u32, bool) {
        let complete = self.terminated && self.parse_errors == 0;
        (self.events, self.snapshot, self.parse_errors, complete)
    }
}

impl Default for SseReassembler {
    fn default() -> Self {
        Self::new()
    }
}

fn append_str_field(block: &mut Value, field: &str, addition: Option<&Value>) {
    let addition = match addition.and_then(Value::as_str) {
        Some(s) => s,
        None => return,
    };
    if let Some(obj) = block.as_object_mut() {
        let entry = obj
            .entry(field.to_string())
            .or_insert_with(|| Value::String(String::new()));
        match entry {
            Value::String(s) => s.push_str(addition),
            other => *other = Value::String(addition.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 标准流式响应：message_start → 文本块 → message_delta → message_stop
    fn sample_stream() -> Vec<u8> {
        let mut out = String::new();
        out.push_str("event: message_start\n");
        out.push_str(r#"data: {"type":"message_start","message":{"id":"msg_01","role":"assistant","content":[],"usage":{"input_tokens":10,"output_tokens":1}}}"#);
        out.push_str("\n\n");
        out.push_str("event: content_block_start\n");
        out.push_str(r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#);
        out.push_str("\n\n");
        for piece in ["Hel", "lo ", "world"] {
            out.push_str("event: content_block_delta\n");
            out.push_str(&format!(
                r#"data: {{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":"{piece}"}}}}"#
            ));
            out.push_str("\n\n");
        }
        out.push_str("event: content_block_stop\n");
        out.push_str(r#"data: {"type":"content_block_stop","index":0}"#);
        out.push_str("\n\n");
        out.push_str("event: message_delta\n");
        out.push_str(r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#);
        out.push_str("\n\n");
        out.push_str("event: message_stop\n");
        out.push_str(r#"data: {"type":"message_stop"}"#);
        out.push_str("\n\n");
        out.into_bytes()
    }

    fn feed_chunked(bytes: &[u8], chunk_size: usize) -> SseReassembler {
        let mut r = SseReassembler::new();
        for chunk in bytes.chunks(chunk_size.max(1)) {
            r.feed(chunk);
        }
        r.finish();
        r
    }

    /// 文本块累积为 "Hello world"，usage.output_tokens 为 3
    #[test]
    fn test_reconstruct_text_and_usage() {
        let mut r = SseReassembler::new();
        r.feed(&sample_stream());
        r.finish();

        let snapshot = r.reconstruct().expect("应该有快照");
        assert_eq!(snapshot["content"][0]["text"], "Hello world");
        assert_eq!(snapshot["usage"]["output_tokens"], 3);
        assert_eq!(snapshot["usage"]["input_tokens"], 10);
        assert_eq!(snapshot["stop_reason"], "end_turn");
        assert!(r.is_complete());
        assert_eq!(r.parse_errors(), 0);
    }

    /// 分块边界不变性：任意切分方式下重组结果一致
    #[test]
    fn test_chunk_boundary_invariance() {
        let bytes = sample_stream();
        let whole = feed_chunked(&bytes, bytes.len());
        let expected = serde_json::to_string(whole.reconstruct().unwrap()).unwrap();

        for chunk_size in [1, 2, 3, 7, 17, 64, 300] {
            let r = feed_chunked(&bytes, chunk_size);
            let got = serde_json::to_string(r.reconstruct().unwrap()).unwrap();
            assert_eq!(got, expected, "chunk_size={} 结果应一致", chunk_size);
            assert_eq!(r.events.len(), whole.events.len());
            assert!(r.is_complete());
        }
    }

    /// 一个 chunk 正中切在多字节字符上也不影响重组（按行缓冲）
    #[test]
    fn test_event_count_and_order() {
        let mut r = SseReassembler::new();
        r.feed(&sample_stream());
        r.finish();
        let names: Vec<&str> = r.events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    /// input_json_delta 片段在块关闭时整体解析为 input
    #[test]
    fn test_input_json_delta_accumulation() {
        let mut r = SseReassembler::new();
        let stream = concat!(
            "event: message_start\n",
            r#"data: {"message":{"id":"msg_02","content":[]}}"#, "\n\n",
            "event: content_block_start\n",
            r#"data: {"index":0,"content_block":{"type":"tool_use","name":"get_weather"}}"#, "\n\n",
            "event: content_block_delta\n",
            r#"data: {"index":0,"delta":{"type":"input_json_delta","partial_json":"{\"loc"}}"#, "\n\n",
            "event: content_block_delta\n",
            r#"data: {"index":0,"delta":{"type":"input_json_delta","partial_json":"ation\":\"SF\"}"}}"#, "\n\n",
            "event: content_block_stop\n",
            r#"data: {"index":0}"#, "\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        );
        r.feed(stream.as_bytes());
        r.finish();

        let snapshot = r.reconstruct().unwrap();
        assert_eq!(snapshot["content"][0]["input"], json!({"location": "SF"}));
        assert_eq!(r.parse_errors(), 0);
    }

    /// 未知事件类型保留在事件列表中但不改变快照
    #[test]
    fn test_unknown_event_preserved_not_accumulated() {
        let mut r = SseReassembler::new();
        let stream = concat!(
            "event: message_start\n",
            r#"data: {"message":{"id":"msg_03","content":[]}}"#, "\n\n",
            "event: ping\n",
            r#"data: {"type":"ping","content":[{"bogus":true}]}"#, "\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        );
        r.feed(stream.as_bytes());
        r.finish();

        assert_eq!(r.events.len(), 3);
        assert_eq!(r.events[1].event, "ping");
        let snapshot = r.reconstruct().unwrap();
        assert_eq!(snapshot["content"], json!([]));
        assert_eq!(r.parse_errors(), 0);
    }

    /// 乱序块下标是该交换范围内的致命解析错误：计错并停止累积
    #[test]
    fn test_out_of_order_block_index_is_fatal() {
        let mut r = SseReassembler::new();
        let stream = concat!(
            "event: message_start\n",
            r#"data: {"message":{"id":"msg_04","content":[]}}"#, "\n\n",
            "event: content_block_start\n",
            r#"data: {"index":2,"content_block":{"type":"text","text":""}}"#, "\n\n",
            "event: content_block_start\n",
            r#"data: {"index":0,"content_block":{"type":"text","text":"late"}}"#, "\n\n",
            "event: message_stop\n",
            "data: {}\n\n",
        );
        r.feed(stream.as_bytes());
        r.finish();

        assert_eq!(r.parse_errors(), 1);
        assert!(!r.is_complete());
        // 快照保持致命错误前的状态
        assert_eq!(r.reconstruct().unwrap()["content"], json!([]));
        // 原始事件列表不受影响
        assert_eq!(r.events.len(), 4);
    }

    /// 多行 data 以换行符拼接
    #[test]
    fn test_multiline_data_joined_with_newline() {
        let mut r = SseReassembler::new();
        r.feed(b"event: custom\ndata: line1\ndata: line2\n\n");
        r.finish();
        assert_eq!(r.events.len(), 1);
        assert_eq!(r.events[0].data, Value::String("line1\nline2".into()));
    }

    /// 流尾未终结块：格式完好则作为最终事件发出
    #[test]
    fn test_trailing_block_flushed_when_well_formed() {
        let mut r = SseReassembler::new();
        r.feed(b"event: message_stop\ndata: {}");
        r.finish();
        assert_eq!(r.events.len(), 1);
        assert_eq!(r.events[0].event, "message_stop");
        assert_eq!(r.parse_errors(), 0);
    }

    /// 流尾未终结块：data 不完整则丢弃并计错
    #[test]
    fn test_trailing_block_discarded_when_malformed() {
        let mut r = SseReassembler::new();
        r.feed(b"event: content_block_delta\ndata: {\"index\":0,\"del");
        r.finish();
        assert_eq!(r.events.len(), 0);
        assert_eq!(r.parse_errors(), 1);
    }

    /// 没有事件名的 data 块计入解析错误
    #[test]
    fn test_data_without_event_counts_error() {
        let mut r = SseReassembler::new();
        r.feed(b"data: {\"orphan\":true}\n\n");
        r.finish();
        assert_eq!(r.events.len(), 0);
        assert_eq!(r.parse_errors(), 1);
    }

    /// CRLF 行结尾与 LF 等价
    #[test]
    fn test_crlf_lines() {
        let mut lf = SseReassembler::new();
        lf.feed(&sample_stream());
        lf.finish();

        let crlf_bytes = String::from_utf8(sample_stream())
            .unwrap()
            .replace('\n', "\r\n");
        let mut crlf = SseReassembler::new();
        crlf.feed(crlf_bytes.as_bytes());
        crlf.finish();

        assert_eq!(
            serde_json::to_string(lf.reconstruct().unwrap()).unwrap(),
            serde_json::to_string(crlf.reconstruct().unwrap()).unwrap()
        );
    }

    /// 缺少 message_stop：快照保留，按部分结果处理
    #[test]
    fn test_missing_terminal_event_keeps_snapshot() {
        let mut r = SseReassembler::new();
        let stream = concat!(
            "event: message_start\n",
            r#"data: {"message":{"id":"msg_05","content":[]}}"#, "\n\n",
            "event: content_block_start\n",
            r#"data: {"index":0,"content_block":{"type":"text","text":"cut"}}"#, "\n\n",
        );
        r.feed(stream.as_bytes());
        r.finish();

        assert!(!r.is_complete());
        assert_eq!(r.parse_errors(), 0);
        assert_eq!(r.reconstruct().unwrap()["content"][0]["text"], "cut");
    }
}
