use std::time::Duration;

use thiserror::Error;

/// 单个检查块解析失败 (只跳过该块, 不影响整页)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("malformed block: {reason}")]
    MalformedBlock { reason: String },
    /// 缺少订单号, 无法分组
    #[error("block {payment_id} has no order number")]
    MissingOrderContext { payment_id: String },
}

/// Page Fetcher 返回的失败分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("throttled by portal")]
    Throttled { retry_after: Option<Duration> },
    #[error("bot-verification challenge detected")]
    ChallengeDetected,
    #[error("authentication expired")]
    AuthExpired,
    #[error("fatal fetch failure: {0}")]
    Fatal(String),
}

/// 状态文件读写错误
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("state file version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("state file belongs to {found}, expected {expected}")]
    DateMismatch {
        found: chrono::NaiveDate,
        expected: chrono::NaiveDate,
    },
}

/// 单日爬取的运行级错误; 状态已持久化, 可续跑
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("challenge did not clear within {0:?}")]
    ChallengeTimeout(Duration),
    #[error("re-authentication failed after {attempts} attempts")]
    AuthExhausted { attempts: u32 },
    #[error("fatal crawl error: {0}")]
    Fatal(String),
    #[error("crawl cancelled")]
    Cancelled,
    #[error("business date {0} is already running")]
    AlreadyRunning(chrono::NaiveDate),
    #[error(transparent)]
    State(#[from] StateError),
}

/// 服务层错误 (二进制 / HTTP 接口)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Crawl(#[from] CrawlError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
