pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod service;
pub mod store;

pub use config::AppConfig;
pub use db::create_pool;
pub use error::{AppError, CrawlError, ExtractionError, FetchError, StateError};
pub use fetcher::{MemoryFetcher, PageFetcher, SnapshotFetcher};
pub use service::{CancelFlag, DatePipeline, RangeRunner};
pub use store::StateStore;
