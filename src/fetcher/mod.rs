//! Page Fetcher 边界: 浏览器自动化层只需实现 [`PageFetcher`]

pub mod memory;
pub mod snapshot;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::FetchError;
use crate::models::FetchedPage;

pub use memory::MemoryFetcher;
pub use snapshot::SnapshotFetcher;

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// 抓取某日明细的第 `page` 页 (从 1 开始)
    async fn fetch(&self, business_date: NaiveDate, page: u32) -> Result<FetchedPage, FetchError>;

    /// 挑战页是否已通过
    async fn challenge_cleared(&self) -> Result<bool, FetchError>;

    async fn reauthenticate(&self) -> Result<(), FetchError>;
}
