pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;

use crate::service::{CancelFlag, RangeRunner};

pub use handlers::*;

/// 共享状态: 多日调度器 + 全局取消标记
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<RangeRunner>,
    pub cancel: CancelFlag,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/crawl", post(crawl_range))
        .route("/api/reports/:date", get(get_report))
        .with_state(state)
        .layer(ServiceBuilder::new())
}
