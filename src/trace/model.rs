//! 调用记录数据模型
//!
//! JSONL 每行一条 `TraceRecord`，字段名是与外部查看器的稳定契约。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::sse::SseEvent;

/// 请求快照（持久化副本，凭据头已脱敏）
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub headers: Map<String, Value>,
    pub body: Value,
}

/// 响应快照
#[derive(Debug, Clone, Serialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: Map<String, Value>,
    pub body: Value,
    /// 流式响应的原始事件列表（按到达顺序）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_events: Option<Vec<SseEvent>>,
    /// 流异常中断或解析失败时标记为部分结果
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    /// 该次交换累计的 SSE 解析错误数
    #[serde(skip_serializing_if = "is_zero")]
    pub parse_errors: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// 一次完整上游交换的调用记录
///
/// 不变量：每次交换恰好一条；追加后不可变；turn 在会话内严格递增
/// （按请求开始顺序分配，与完成顺序无关）。
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub timestamp: String,
    pub request_id: String,
    pub turn: u64,
    pub duration_ms: u64,
    pub request: RequestSnapshot,
    pub response: ResponseSnapshot,
}

/// 单条记录的 token 用量
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_create_tokens: u64,
}

impl TraceRecord {
    /// 生成新的请求 ID（req_ + 12 位十六进制）
    pub fn new_request_id() -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("req_{}", &hex[..12])
    }

    /// 请求体里的模型名（缺失时 "unknown"）
    pub fn model(&self) -> &str {
        self.request
            .body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    /// 从响应体提取 token 用量，字段缺失按 0 处理
    pub fn usage(&self) -> TokenUsage {
        let body = &self.response.body;
        let usage = match body.get("usage") {
            Some(usage) if usage.is_object() => usage,
            // 某些端点直接在顶层返回用量字段
            _ => body,
        };
        let get = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
        TokenUsage {
            input_tokens: get("input_tokens"),
            output_tokens: get("output_tokens"),
            cache_read_tokens: get("cache_read_input_tokens"),
            cache_create_tokens: get("cache_creation_input_tokens"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with_body(body: Value) -> TraceRecord {
        TraceRecord {
            timestamp: "2026-01-01T00:00:00Z".into(),
            request_id: TraceRecord::new_request_id(),
            turn: 1,
            duration_ms: 42,
            request: RequestSnapshot {
                method: "POST".into(),
                path: "/v1/messages".into(),
                headers: Map::new(),
                body: json!({"model": "claude-sonnet-4-5"}),
            },
            response: ResponseSnapshot {
                status: 200,
                headers: Map::new(),
                body,
                sse_events: None,
                partial: None,
                parse_errors: 0,
            },
        }
    }

    /// request_id 格式固定为 req_ + 12 位十六进制
    #[test]
    fn test_request_id_format() {
        let id = TraceRecord::new_request_id();
        assert!(id.starts_with("req_"));
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    /// usage 字段缺失时全部按 0
    #[test]
    fn test_usage_defaults_to_zero() {
        let r = record_with_body(json!({"content": []}));
        let u = r.usage();
        assert_eq!(u.input_tokens, 0);
        assert_eq!(u.output_tokens, 0);
    }

    /// 嵌套 usage 对象优先，顶层字段作为回退
    #[test]
    fn test_usage_extraction() {
        let r = record_with_body(json!({
            "usage": {"input_tokens": 10, "output_tokens": 3, "cache_read_input_tokens": 7}
        }));
        let u = r.usage();
        assert_eq!(u.input_tokens, 10);
        assert_eq!(u.output_tokens, 3);
        assert_eq!(u.cache_read_tokens, 7);
        assert_eq!(u.cache_create_tokens, 0);

        let top = record_with_body(json!({"input_tokens": 5}));
        assert_eq!(top.usage().input_tokens, 5);
    }

    /// 序列化时可选字段按需省略，字段名保持稳定
    #[test]
    fn test_serialized_field_names() {
        let r = record_with_body(json!(null));
        let line = serde_json::to_string(&r).unwrap();
        assert!(line.contains(r#""timestamp""#));
        assert!(line.contains(r#""request_id""#));
        assert!(line.contains(r#""turn":1"#));
        assert!(line.contains(r#""duration_ms":42"#));
        assert!(line.contains(r#""body":null"#));
        assert!(!line.contains("sse_events"));
        assert!(!line.contains("partial"));
        assert!(!line.contains("parse_errors"));
    }
}
