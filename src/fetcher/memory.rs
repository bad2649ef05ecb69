use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::PageFetcher;
use crate::error::FetchError;
use crate::models::{FetchedPage, NextPage};

/// 内存中的页面源: 用于回放与测试
///
/// 每页先消费一次性脚本响应, 之后返回稳定页面; 未登记的页为空页。
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    pages: Mutex<BTreeMap<u32, FetchedPage>>,
    scripted: Mutex<BTreeMap<u32, VecDeque<Result<FetchedPage, FetchError>>>>,
    challenge_polls: Mutex<VecDeque<bool>>,
    reauth_results: Mutex<VecDeque<Result<(), FetchError>>>,
    fetch_log: Mutex<Vec<u32>>,
    reauth_calls: Mutex<u32>,
    latency: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(pages: impl IntoIterator<Item = (u32, FetchedPage)>) -> Self {
        let fetcher = Self::new();
        lock(&fetcher.pages).extend(pages);
        fetcher
    }

    /// 每次抓取前等待, 模拟慢速门户
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_page(&self, page: u32, content: FetchedPage) {
        lock(&self.pages).insert(page, content);
    }

    /// 追加一次性响应, 按顺序消费
    pub fn script(&self, page: u32, response: Result<FetchedPage, FetchError>) {
        lock(&self.scripted).entry(page).or_default().push_back(response);
    }

    pub fn script_challenge_polls(&self, polls: impl IntoIterator<Item = bool>) {
        lock(&self.challenge_polls).extend(polls);
    }

    pub fn script_reauth(&self, result: Result<(), FetchError>) {
        lock(&self.reauth_results).push_back(result);
    }

    /// 已发出的抓取 (页号顺序)
    pub fn fetch_log(&self) -> Vec<u32> {
        lock(&self.fetch_log).clone()
    }

    pub fn reauth_calls(&self) -> u32 {
        *lock(&self.reauth_calls)
    }
}

#[async_trait]
impl PageFetcher for MemoryFetcher {
    async fn fetch(&self, _business_date: NaiveDate, page: u32) -> Result<FetchedPage, FetchError> {
        lock(&self.fetch_log).push(page);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(response) = lock(&self.scripted)
            .get_mut(&page)
            .and_then(|queue| queue.pop_front())
        {
            return response;
        }
        Ok(lock(&self.pages).get(&page).cloned().unwrap_or(FetchedPage {
            next: NextPage::End,
            ..Default::default()
        }))
    }

    async fn challenge_cleared(&self) -> Result<bool, FetchError> {
        Ok(lock(&self.challenge_polls).pop_front().unwrap_or(true))
    }

    async fn reauthenticate(&self) -> Result<(), FetchError> {
        *lock(&self.reauth_calls) += 1;
        lock(&self.reauth_results).pop_front().unwrap_or(Ok(()))
    }
}
