//! 实时广播模块
//!
//! 记录落盘后推送给任意数量的 SSE 订阅端；新订阅端先收到本会话
//! 已持久化的全部记录回放，再接收实时更新。慢订阅端只会被断开，
//! 不会阻塞其他订阅端或代理管线。

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::viewer;

/// 每个订阅端的有界缓冲容量，落后超过该值即断开
const SUBSCRIBER_BUFFER: usize = 256;

/// 广播中心：回放缓冲 + 有界扇出通道
///
/// 缓冲与订阅在同一把锁下操作，保证回放与实时推送之间无缝隙。
pub struct LiveHub {
    backlog: Mutex<Vec<Arc<str>>>,
    tx: broadcast::Sender<Arc<str>>,
}

impl LiveHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            backlog: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// 发布一条已落盘的记录行（无订阅端时静默成功）
    pub fn publish(&self, line: Arc<str>) {
        let mut backlog = self.backlog.lock();
        backlog.push(line.clone());
        // 持锁发送：订阅端要么在回放里看到这条，要么从通道收到
        let _ = self.tx.send(line);
    }

    /// 订阅：返回当前回放快照与后续实时接收端
    pub fn subscribe(&self) -> (Vec<Arc<str>>, broadcast::Receiver<Arc<str>>) {
        let backlog = self.backlog.lock();
        (backlog.clone(), self.tx.subscribe())
    }

    /// 全部记录拼成 JSON 数组（每行本身已是合法 JSON）
    pub fn records_json(&self) -> String {
        let backlog = self.backlog.lock();
        let mut out = String::from("[");
        for (i, line) in backlog.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(line);
        }
        out.push(']');
        out
    }

    pub fn len(&self) -> usize {
        self.backlog.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.lock().is_empty()
    }
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new()
    }
}

/// 实时查看服务的共享状态
#[derive(Clone)]
struct LiveState {
    hub: Arc<LiveHub>,
    trace_path: PathBuf,
}

/// 实时查看 HTTP 服务
pub struct LiveServer {
    pub hub: Arc<LiveHub>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl LiveServer {
    /// 绑定本地端口并启动服务（port 为 0 时自动分配）
    pub async fn start(port: u16, trace_path: PathBuf) -> Result<Self> {
        let hub = Arc::new(LiveHub::new());
        let state = LiveState {
            hub: hub.clone(),
            trace_path,
        };

        let app = Router::new()
            .route("/", get(live_index))
            .route("/events", get(live_events))
            .route("/records", get(live_records))
            .layer(crate::proxy::cors_layer())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("实时查看服务绑定端口失败: {}", port))?;
        let addr = listener.local_addr().context("获取实时服务地址失败")?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("实时查看服务退出: {}", e);
            }
        });

        tracing::info!("实时查看服务已启动: http://{}", addr);
        Ok(Self { hub, addr, handle })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// 停止服务；订阅端流随任务终止而结束
    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// GET / — 实时模式的查看器页面
async fn live_index(State(state): State<LiveState>) -> impl IntoResponse {
    match viewer::render_live_page(&state.trace_path) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("渲染实时页面失败: {}", e);
            (StatusCode::NOT_FOUND, "viewer template not found").into_response()
        }
    }
}

/// GET /events — SSE：先全量回放，再实时推送
async fn live_events(State(state): State<LiveState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (backlog, rx) = state.hub.subscribe();

    let replay = stream::iter(
        backlog
            .into_iter()
            .map(|line| Ok(Event::default().data(line.as_ref().to_string()))),
    );

    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(line) => {
                    return Some((Ok(Event::default().data(line.as_ref().to_string())), rx));
                }
                // 落后太多：按断开策略结束该订阅端，不影响其他端
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("订阅端落后 {} 条记录，断开连接", n);
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(replay.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}

/// GET /records — 当前全部记录的 JSON 数组
async fn live_records(State(state): State<LiveState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.hub.records_json(),
    )
}
