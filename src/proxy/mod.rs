//! 反向代理监听模块
//!
//! 接收子进程的本地连接，转发到上游 API 并驱动重组与记录。

mod handler;
pub mod headers;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use axum::Router;

use crate::trace::TraceWriter;

pub use handler::proxy_handler;

/// 代理共享状态
///
/// 各交换管线之间唯一的共享可变状态是写入器的追加接口和 turn 计数器。
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    /// 上游 API 基地址
    pub target: Arc<str>,
    pub writer: Arc<TraceWriter>,
    turns: Arc<AtomicU64>,
}

impl ProxyState {
    pub fn new(client: reqwest::Client, target: impl Into<Arc<str>>, writer: Arc<TraceWriter>) -> Self {
        Self {
            client,
            target: target.into(),
            writer,
            turns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 分配下一个 turn 序号（从 1 开始，按请求开始顺序严格递增）
    pub fn next_turn(&self) -> u64 {
        self.turns.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// 构建上游 HTTP Client
///
/// 不启用自动解压：流式与非流式路径都要拿到上游的原始字节逐字转发。
pub fn build_client(connect_timeout_secs: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .build()?;
    Ok(client)
}

/// CORS 中间件层（实时查看服务使用，允许任意来源）
pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// 创建代理路由：任意方法、任意路径全部走代理处理器
pub fn create_proxy_router(state: ProxyState) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}
