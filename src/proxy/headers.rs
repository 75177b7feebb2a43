//! 转发与持久化的请求/响应头处理
//!
//! 转发路径只剔除逐跳头和 Host，其余原样透传（凭据不改动）；
//! 持久化副本额外对凭据头做前缀脱敏。

use http::{HeaderMap, header};
use serde_json::{Map, Value};

/// RFC 7230 逐跳头，不跨代理转发
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// 持久化副本中需要脱敏的凭据头
const CREDENTIAL_HEADERS: &[&str] = &["x-api-key", "authorization"];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// 构造转发给上游/下游的头：剔除逐跳头和 Host，其余逐字保留
pub fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || name == header::HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// 凭据值脱敏：保留前 12 字节前缀 + "..."，过短则整体掩码
pub fn mask_credential(value: &str) -> String {
    if value.len() > 12 {
        format!("{}...", crate::common::truncate_str_safe(value, 12))
    } else {
        "***".to_string()
    }
}

/// 构造持久化副本中的头快照（JSON 对象），可选凭据脱敏
pub fn snapshot_headers(headers: &HeaderMap, redact: bool) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let text = value.to_str().unwrap_or("<binary>");
        let text = if redact
            && CREDENTIAL_HEADERS
                .iter()
                .any(|h| name.as_str().eq_ignore_ascii_case(h))
        {
            mask_credential(text)
        } else {
            text.to_string()
        };
        out.insert(name.as_str().to_string(), Value::String(text));
    }
    out
}
