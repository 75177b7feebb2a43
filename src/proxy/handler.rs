//! 代理转发处理器
//!
//! 每个入站请求一条独立管线：读请求 → 转发上游 → 响应字节
//! 立即回写给子进程，同时并发喂给 SSE 重组器；交换完成后构建
//! 一条 TraceRecord 交给写入器。持久化永远不会拖慢转发路径。

use std::io;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use crate::sse::SseReassembler;
use crate::trace::{RequestSnapshot, ResponseSnapshot, TraceRecord};

use super::headers::{forward_headers, snapshot_headers};
use super::ProxyState;

/// 上游请求整体超时（含流式响应体），与上游 SDK 的长请求上限对齐
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// 转发通道容量：只做传输层最小缓冲，不引入额外延迟
const FORWARD_BUFFER: usize = 16;

/// 通配代理入口：任意方法、任意路径
pub async fn proxy_handler(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let path_qs = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let upstream_url = format!("{}{}", state.target.trim_end_matches('/'), path_qs);

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("读取请求体失败: {}", e);
            return (StatusCode::BAD_REQUEST, format!("bad request body: {e}")).into_response();
        }
    };

    // 请求体快照：JSON 优先，否则按字符串保留
    let req_body = parse_body(&body_bytes);
    let is_streaming = req_body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let model = req_body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    // turn 在请求开始时分配：严格递增，与完成顺序无关
    let turn = state.next_turn();
    let request_id = TraceRecord::new_request_id();
    let started = Instant::now();

    tracing::info!(
        "[Turn {}] → {} {} (model={}, stream={})",
        turn,
        parts.method,
        path_qs,
        model,
        is_streaming
    );

    let mut fwd_headers = forward_headers(&parts.headers);
    if is_streaming {
        // SSE 必须是可解析的明文，要求上游不压缩
        fwd_headers.insert(
            http::header::ACCEPT_ENCODING,
            http::HeaderValue::from_static("identity"),
        );
    }

    let request_snapshot = RequestSnapshot {
        method: parts.method.to_string(),
        path: path_qs.clone(),
        headers: snapshot_headers(&parts.headers, true),
        body: req_body,
    };

    let upstream = state
        .client
        .request(parts.method.clone(), &upstream_url)
        .headers(fwd_headers)
        .body(body_bytes.to_vec())
        .timeout(UPSTREAM_TIMEOUT)
        .send()
        .await;

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            // 上游不可达也要产出恰好一条记录，并以普通错误响应回给子进程
            tracing::error!(
                "[Turn {}] 上游请求失败: {} -- 请确认目标 {} 可达",
                turn,
                e,
                state.target
            );
            let record = TraceRecord {
                timestamp: Utc::now().to_rfc3339(),
                request_id,
                turn,
                duration_ms: started.elapsed().as_millis() as u64,
                request: request_snapshot,
                response: ResponseSnapshot {
                    status: 502,
                    headers: serde_json::Map::new(),
                    body: Value::String(e.to_string()),
                    sse_events: None,
                    partial: None,
                    parse_errors: 0,
                },
            };
            if let Err(we) = state.writer.write(&record).await {
                tracing::error!("[Turn {}] 记录写入失败: {}", turn, we);
            }
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    if is_streaming && upstream.status() == reqwest::StatusCode::OK {
        handle_streaming(state, upstream, request_snapshot, request_id, turn, started).await
    } else {
        handle_non_streaming(state, upstream, request_snapshot, request_id, turn, started).await
    }
}

/// 流式响应：上游字节到达即转发，重组与持久化在同一管线内并发进行
async fn handle_streaming(
    state: ProxyState,
    upstream: reqwest::Response,
    request_snapshot: RequestSnapshot,
    request_id: String,
    turn: u64,
    started: Instant,
) -> Response {
    let status = upstream.status();
    let resp_headers = upstream.headers().clone();
    // 记录路径持有独立副本，原头部留给转发响应
    let record_headers = resp_headers.clone();

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(FORWARD_BUFFER);

    tokio::spawn(async move {
        let mut tx = tx;
        let mut reassembler = SseReassembler::new();
        let mut stream = upstream.bytes_stream();
        let mut upstream_error: Option<String> = None;
        let mut child_gone = false;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    // 先转发，后解析：转发路径绝不等待记录路径
                    if !child_gone && tx.send(Ok(bytes.clone())).await.is_err() {
                        // 子进程断开只取消本交换的转发，重组继续收尾
                        child_gone = true;
                    }
                    reassembler.feed(&bytes);
                    if child_gone {
                        break;
                    }
                }
                Err(e) => {
                    upstream_error = Some(e.to_string());
                    break;
                }
            }
        }
        drop(tx);
        reassembler.finish();

        let duration_ms = started.elapsed().as_millis() as u64;
        let (events, snapshot, parse_errors, complete) = reassembler.into_parts();
        let interrupted = upstream_error.is_some() || child_gone;

        let record = TraceRecord {
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            turn,
            duration_ms,
            request: request_snapshot,
            response: ResponseSnapshot {
                status: status.as_u16(),
                headers: snapshot_headers(&record_headers, false),
                body: snapshot.unwrap_or(Value::Null),
                sse_events: Some(events),
                partial: (!complete || interrupted).then_some(true),
                parse_errors,
            },
        };

        let usage = record.usage();
        tracing::info!(
            "[Turn {}] ← {} stream done ({}ms, in={} out={} cache_read={} cache_create={})",
            turn,
            status.as_u16(),
            duration_ms,
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_read_tokens,
            usage.cache_create_tokens
        );
        if let Some(e) = upstream_error {
            tracing::warn!("[Turn {}] 上游流中断: {}", turn, e);
        }

        if let Err(e) = state.writer.write(&record).await {
            tracing::error!("[Turn {}] 记录写入失败: {}", turn, e);
        }
    });

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(rx))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    *response.headers_mut() = forward_headers(&resp_headers);
    response
}

/// 非流式响应：整体读取、逐字节转发、逐字节持久化
async fn handle_non_streaming(
    state: ProxyState,
    upstream: reqwest::Response,
    request_snapshot: RequestSnapshot,
    request_id: String,
    turn: u64,
    started: Instant,
) -> Response {
    let status = upstream.status();
    let resp_headers = upstream.headers().clone();

    let resp_bytes = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!("[Turn {}] 读取上游响应失败: {}", turn, e);
            let record = TraceRecord {
                timestamp: Utc::now().to_rfc3339(),
                request_id,
                turn,
                duration_ms: started.elapsed().as_millis() as u64,
                request: request_snapshot,
                response: ResponseSnapshot {
                    status: status.as_u16(),
                    headers: snapshot_headers(&resp_headers, false),
                    body: Value::String(e.to_string()),
                    sse_events: None,
                    partial: Some(true),
                    parse_errors: 0,
                },
            };
            if let Err(we) = state.writer.write(&record).await {
                tracing::error!("[Turn {}] 记录写入失败: {}", turn, we);
            }
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    // 持久化副本按需解压；转发给子进程的始终是原始字节
    let content_encoding = resp_headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let decoded = decode_body(&resp_bytes, &content_encoding);
    let resp_body = parse_body(&decoded);

    tracing::info!(
        "[Turn {}] ← {} ({}ms, {} bytes)",
        turn,
        status.as_u16(),
        duration_ms,
        resp_bytes.len()
    );

    let record = TraceRecord {
        timestamp: Utc::now().to_rfc3339(),
        request_id,
        turn,
        duration_ms,
        request: request_snapshot,
        response: ResponseSnapshot {
            status: status.as_u16(),
            headers: snapshot_headers(&resp_headers, false),
            body: resp_body,
            sse_events: None,
            partial: None,
            parse_errors: 0,
        },
    };
    if let Err(e) = state.writer.write(&record).await {
        tracing::error!("[Turn {}] 记录写入失败: {}", turn, e);
    }

    let mut response = Response::builder()
        .status(status)
        .body(Body::from(resp_bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    *response.headers_mut() = forward_headers(&resp_headers);
    response
}

/// 字节 → 记录体：空为 null，JSON 优先，否则按 lossy 字符串
fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// 为持久化副本解压 gzip/deflate 响应体；失败时退回原始字节
fn decode_body(bytes: &[u8], content_encoding: &str) -> Vec<u8> {
    use std::io::Read;
    match content_encoding {
        "gzip" => {
            let mut out = Vec::new();
            match flate2::read::GzDecoder::new(bytes).read_to_end(&mut out) {
                Ok(_) => out,
                Err(_) => bytes.to_vec(),
            }
        }
        "deflate" => {
            let mut out = Vec::new();
            match flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut out) {
                Ok(_) => out,
                Err(_) => bytes.to_vec(),
            }
        }
        _ => bytes.to_vec(),
    }
}
