use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use super::PageFetcher;
use crate::error::FetchError;
use crate::models::{FetchedPage, NextPage};

/// 从 `<root>/<date>/page-NNNN.json` 读取浏览器层导出的页面
///
/// 缺少的页视为空页 (结束)。
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    root: PathBuf,
}

impl SnapshotFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn page_path(&self, business_date: NaiveDate, page: u32) -> PathBuf {
        self.root
            .join(business_date.format("%Y-%m-%d").to_string())
            .join(format!("page-{page:04}.json"))
    }
}

#[async_trait]
impl PageFetcher for SnapshotFetcher {
    async fn fetch(&self, business_date: NaiveDate, page: u32) -> Result<FetchedPage, FetchError> {
        let path = self.page_path(business_date, page);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot, treating as end of pages");
                return Ok(FetchedPage {
                    next: NextPage::End,
                    ..Default::default()
                });
            }
            Err(e) => return Err(FetchError::Transient(format!("{}: {e}", path.display()))),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Fatal(format!("{}: {e}", path.display())))
    }

    async fn challenge_cleared(&self) -> Result<bool, FetchError> {
        Ok(true)
    }

    async fn reauthenticate(&self) -> Result<(), FetchError> {
        Ok(())
    }
}
