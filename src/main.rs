use check_extract_rust::api::{self, AppState};
use check_extract_rust::db;
use check_extract_rust::{
    create_pool, AppConfig, AppError, CancelFlag, DatePipeline, RangeRunner, SnapshotFetcher,
    StateStore,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // 初始化日志 - 本地时间格式, RUST_LOG 可覆盖级别
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::load()?;
    info!("Starting server with config: {:?}", config);

    let fetcher = Arc::new(SnapshotFetcher::new(&config.run.snapshot_dir));
    let store = StateStore::new(&config.run.state_dir);
    let pipeline = Arc::new(DatePipeline::new(fetcher, store, &config));

    let mut runner =
        RangeRunner::new(pipeline, config.run.date_workers).with_output_dir(&config.run.output_dir);

    // 数据库可选: 未启用时只写 JSON / CSV
    if config.database.enabled {
        let pool = create_pool(&config.database).await?;
        db::ensure_schema(&pool).await?;
        info!("Database pool created");
        runner = runner.with_pool(pool);
    } else {
        warn!("Database disabled, reports are written to {}", config.run.output_dir.display());
    }

    let state = AppState {
        runner: Arc::new(runner),
        cancel: CancelFlag::new(),
    };

    let cancel = state.cancel.clone();
    let app = api::router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/crawl           - crawl a business-date range");
    info!("  GET  /api/reports/:date   - latest report for a date");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    Ok(())
}

/// Ctrl-C: 通知进行中的爬取在当前页之后停止, 再关闭服务
async fn shutdown_signal(cancel: CancelFlag) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Ctrl-C received, stopping crawls after the current page");
    }
    cancel.cancel();
}
