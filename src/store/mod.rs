//! 爬取状态持久化: 每个营业日一个 JSON 文件, 先写临时文件再原子替换

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::StateError;
use crate::models::state::{CrawlState, STATE_VERSION};

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `state_<YYYY-MM-DD>.json`
    pub fn path_for(&self, business_date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("state_{}.json", business_date.format("%Y-%m-%d")))
    }

    /// 读取已有状态; 文件不存在返回 None
    pub async fn load(&self, business_date: NaiveDate) -> Result<Option<CrawlState>, StateError> {
        let path = self.path_for(business_date);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: CrawlState = serde_json::from_slice(&bytes)?;
        if state.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: state.version,
                supported: STATE_VERSION,
            });
        }
        if state.business_date != business_date {
            return Err(StateError::DateMismatch {
                found: state.business_date,
                expected: business_date,
            });
        }
        info!(
            business_date = %business_date,
            pass = state.pass,
            pages_completed = state.pages_completed.len(),
            records = state.records.len(),
            terminal = state.terminal,
            "Loaded crawl state"
        );
        Ok(Some(state))
    }

    pub async fn load_or_new(
        &self,
        business_date: NaiveDate,
        run_id: &str,
    ) -> Result<CrawlState, StateError> {
        match self.load(business_date).await? {
            Some(state) => Ok(state),
            None => Ok(CrawlState::new(business_date, run_id)),
        }
    }

    /// 写入 `<path>.tmp`, fsync, 再 rename 覆盖正式文件
    pub async fn persist(&self, state: &CrawlState) -> Result<(), StateError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(state.business_date);
        let temp_path = path.with_extension("json.tmp");

        let content = serde_json::to_vec_pretty(state)?;
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &path).await?;
        debug!(path = %path.display(), bytes = content.len(), "State persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::PageMerge;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = CrawlState::new(date(), "run-1").merge_page(PageMerge {
            page: 1,
            ..Default::default()
        });

        store.persist(&state).await.unwrap();
        let loaded = store.load(date()).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!store.path_for(date()).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load(date()).await.unwrap().is_none());
        let fresh = store.load_or_new(date(), "run-2").await.unwrap();
        assert_eq!(fresh.run_id, "run-2");
    }

    #[tokio::test]
    async fn leftover_temp_file_does_not_affect_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = CrawlState::new(date(), "run-1");
        store.persist(&state).await.unwrap();
        std::fs::write(store.path_for(date()).with_extension("json.tmp"), b"{trunc").unwrap();

        let loaded = store.load(date()).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-1");
    }

    #[tokio::test]
    async fn newer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = CrawlState::new(date(), "run-1");
        state.version = STATE_VERSION + 1;
        store.persist(&state).await.unwrap();

        assert!(matches!(
            store.load(date()).await,
            Err(StateError::UnsupportedVersion { .. })
        ));
    }
}
