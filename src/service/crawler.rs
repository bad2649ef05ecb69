//! Crawl State Machine: 按页推进单个营业日的爬取
//!
//! 页内重试由 [`PageRetry`] 负责, 本模块只管翻页游标、挑战/登录暂停和状态持久化。
//! 每次状态变更都先落盘再继续, 崩溃最多丢失一个进行中的页。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, warn};

use super::backoff::{BackoffPolicy, PageRetry, RetryDecision};
use super::extractor::{extract_block, BlockContext};
use crate::config::CrawlConfig;
use crate::error::{CrawlError, ExtractionError, FetchError};
use crate::fetcher::PageFetcher;
use crate::models::state::{PageMerge, SIGNATURE_LEN};
use crate::models::{CheckRecord, CrawlState, FetchedPage};
use crate::store::StateStore;

/// 协作式取消: 只在两页之间检查
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 状态机所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    Idle { page: u32 },
    Fetching { page: u32, attempt: u32 },
    Parsed { page: u32 },
    Throttled { page: u32, failures: u32 },
    ChallengeDetected { page: u32 },
    AuthExpired { page: u32 },
    FatalError,
    Terminal,
}

/// 单页的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageResult {
    Parsed,
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub state: CrawlState,
    /// 本次调用中解析成功的页 (按轮次先后)
    pub pages_parsed: Vec<u32>,
    /// 调用前已是终态, 未发出任何抓取
    pub already_terminal: bool,
}

pub struct DateCrawler {
    fetcher: Arc<dyn PageFetcher>,
    store: StateStore,
    config: CrawlConfig,
    policy: BackoffPolicy,
    phase: CrawlPhase,
}

impl DateCrawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>, store: StateStore, config: CrawlConfig) -> Self {
        let policy = BackoffPolicy::from_config(&config);
        Self {
            fetcher,
            store,
            config,
            policy,
            phase: CrawlPhase::Idle { page: 1 },
        }
    }

    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    fn transition(&mut self, next: CrawlPhase) {
        debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }

    /// 从给定状态开始 (或继续) 爬取, 直到终态
    ///
    /// 已是终态时不发任何请求, 原样返回记录集。运行级失败时状态已落盘, 可用同一文件续跑。
    pub async fn run(&mut self, state: CrawlState, cancel: &CancelFlag) -> Result<CrawlOutcome, CrawlError> {
        let business_date = state.business_date;
        if state.terminal {
            info!(%business_date, records = state.records.len(), "Crawl already terminal, nothing to do");
            self.transition(CrawlPhase::Terminal);
            return Ok(CrawlOutcome {
                state,
                pages_parsed: Vec::new(),
                already_terminal: true,
            });
        }

        if !state.pages_completed.is_empty() || !state.passes.is_empty() {
            info!(
                %business_date,
                pass = state.pass,
                pages_completed = ?state.pages_completed,
                ids_seen = state.payment_ids_seen.len(),
                "Resuming crawl"
            );
        }
        let mut state = state.resume();
        let mut pages_parsed = Vec::new();
        let max_passes = self.config.total_passes();

        loop {
            let mut cursor = 1u32;
            let mut consecutive_gave_up = 0u32;
            info!(%business_date, pass = state.pass, "Starting pass");

            loop {
                if cancel.is_cancelled() {
                    return Err(self.stop(state, CrawlError::Cancelled).await);
                }
                if state.pass_exhausted(cursor) {
                    break;
                }
                if self.config.max_pages > 0 && cursor > self.config.max_pages {
                    info!(%business_date, max_pages = self.config.max_pages, "Page limit reached");
                    break;
                }
                if state.pages_completed.contains(&cursor) {
                    cursor += 1;
                    continue;
                }
                if state.end_page.is_none()
                    && self.config.max_consecutive_gave_up > 0
                    && consecutive_gave_up >= self.config.max_consecutive_gave_up
                {
                    warn!(
                        %business_date,
                        page = cursor,
                        consecutive_gave_up,
                        "Too many consecutive pages given up, ending pass"
                    );
                    break;
                }

                if !pages_parsed.is_empty() || consecutive_gave_up > 0 {
                    self.human_pause().await;
                }
                self.transition(CrawlPhase::Idle { page: cursor });
                let (next_state, result) = self.crawl_page(state, cursor).await?;
                state = next_state;
                match result {
                    PageResult::Parsed => {
                        pages_parsed.push(cursor);
                        consecutive_gave_up = 0;
                    }
                    PageResult::GaveUp => consecutive_gave_up += 1,
                }
                cursor += 1;
            }

            let pass = state.pass;
            state = state.close_pass(max_passes);
            self.persist(&state).await?;
            let observation = state.passes.last();
            info!(
                %business_date,
                pass,
                new_ids = observation.map(|o| o.new_ids).unwrap_or(0),
                total_ids = state.payment_ids_seen.len(),
                incomplete = state.is_incomplete(),
                "Pass finished"
            );
            if state.terminal {
                break;
            }
        }

        self.transition(CrawlPhase::Terminal);
        info!(
            %business_date,
            records = state.records.len(),
            gave_up = ?state.pages_gave_up,
            "Crawl terminal"
        );
        Ok(CrawlOutcome {
            state,
            pages_parsed,
            already_terminal: false,
        })
    }

    /// 抓取一页直到解析成功或放弃; 挑战与登录失效在这里暂停整个爬取
    async fn crawl_page(
        &mut self,
        mut state: CrawlState,
        page: u32,
    ) -> Result<(CrawlState, PageResult), CrawlError> {
        let business_date = state.business_date;
        let mut retry = PageRetry::resume(page, state.pending_retries.get(&page));
        if let Some(entry) = state.pending_retries.get(&page) {
            let wait = (entry.next_eligible_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.policy.ceiling);
            if !wait.is_zero() {
                info!(%business_date, page, wait_ms = wait.as_millis() as u64, "Waiting for persisted retry window");
                tokio::time::sleep(wait).await;
            }
        }
        let mut challenges = 0u32;
        let mut auth_cycles = 0u32;

        loop {
            self.transition(CrawlPhase::Fetching {
                page,
                attempt: retry.attempt(),
            });
            let fetched = match tokio::time::timeout(
                self.config.fetch_timeout(),
                self.fetcher.fetch(business_date, page),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::Transient(format!(
                    "fetch timed out after {:?}",
                    self.config.fetch_timeout()
                ))),
            };

            match fetched {
                Ok(fetched) => {
                    self.transition(CrawlPhase::Parsed { page });
                    let state = self.merge(state, page, retry.attempt(), fetched);
                    self.persist(&state).await?;
                    return Ok((state, PageResult::Parsed));
                }
                Err(err @ (FetchError::Throttled { .. } | FetchError::Transient(_))) => {
                    let retry_after = match &err {
                        FetchError::Throttled { retry_after } => *retry_after,
                        _ => None,
                    };
                    self.transition(CrawlPhase::Throttled {
                        page,
                        failures: retry.failures() + 1,
                    });
                    match retry.record_failure(&self.policy, retry_after, Utc::now()) {
                        RetryDecision::RetryAfter { delay, eligible_at } => {
                            warn!(
                                %business_date,
                                page,
                                attempt = retry.failures(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Page fetch failed, backing off"
                            );
                            state = state.record_retry(page, retry.to_entry(eligible_at, &err.to_string()));
                            self.persist(&state).await?;
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            warn!(
                                %business_date,
                                page,
                                failures = retry.failures(),
                                error = %err,
                                "Retry budget exhausted, giving up page"
                            );
                            state = state.give_up_page(page, &err.to_string());
                            self.persist(&state).await?;
                            return Ok((state, PageResult::GaveUp));
                        }
                    }
                }
                Err(FetchError::ChallengeDetected) => {
                    self.transition(CrawlPhase::ChallengeDetected { page });
                    challenges += 1;
                    if challenges > self.config.max_retries_per_page.max(1) {
                        let err = CrawlError::Fatal(format!("challenge keeps reappearing on page {page}"));
                        return Err(self.stop(state, err).await);
                    }
                    warn!(%business_date, page, "Bot-verification challenge detected, pausing crawl");
                    if let Err(err) = self.wait_for_challenge().await {
                        return Err(self.stop(state, err).await);
                    }
                    info!(%business_date, page, "Challenge cleared, resuming");
                }
                Err(FetchError::AuthExpired) => {
                    self.transition(CrawlPhase::AuthExpired { page });
                    auth_cycles += 1;
                    if auth_cycles > self.config.reauth_max_attempts {
                        let err = CrawlError::AuthExhausted {
                            attempts: self.config.reauth_max_attempts,
                        };
                        return Err(self.stop(state, err).await);
                    }
                    warn!(%business_date, page, "Session expired, re-authenticating");
                    if let Err(err) = self.reauthenticate().await {
                        return Err(self.stop(state, err).await);
                    }
                }
                Err(FetchError::Fatal(reason)) => {
                    return Err(self.stop(state, CrawlError::Fatal(reason)).await);
                }
            }
        }
    }

    /// 解析整页: 坏块只跳过自身
    fn merge(&self, state: CrawlState, page: u32, attempt: u32, fetched: FetchedPage) -> CrawlState {
        let business_date = state.business_date;
        let ctx = BlockContext {
            business_date,
            page,
            attempt,
            pass: state.pass,
            page_order_header: fetched.order_header.as_deref(),
        };

        let mut records: Vec<CheckRecord> = Vec::with_capacity(fetched.blocks.len());
        let mut skipped = 0usize;
        for (index, block) in fetched.blocks.iter().enumerate() {
            match extract_block(block, &ctx) {
                Ok(record) => {
                    debug!(page, payment_id = %record.payment_id, order_number = record.order_number, "Block parsed");
                    records.push(record);
                }
                Err(ExtractionError::MalformedBlock { reason }) => {
                    skipped += 1;
                    warn!(%business_date, page, block = index, %reason, "Skipping malformed block");
                }
                Err(ExtractionError::MissingOrderContext { payment_id }) => {
                    skipped += 1;
                    warn!(%business_date, page, block = index, %payment_id, "Skipping block without order number");
                }
            }
        }

        let signature: Vec<String> = records
            .iter()
            .take(SIGNATURE_LEN)
            .map(|r| r.payment_id.clone())
            .collect();
        let stalled_on = state.repeated_signature(page, &signature);
        if let Some(previous) = stalled_on {
            warn!(%business_date, page, previous, "Pagination stalled, page repeats an earlier page");
        }
        let is_last = fetched.is_last();
        info!(
            %business_date,
            page,
            pass = state.pass,
            records = records.len(),
            skipped,
            is_last,
            "Page parsed"
        );

        state.merge_page(PageMerge {
            page,
            records,
            order_totals: fetched.order_totals,
            pagination: fetched.pagination,
            blocks_skipped: skipped,
            is_last,
            stalled_on,
        })
    }

    /// 轮询挑战状态, 超时即运行级失败
    async fn wait_for_challenge(&self) -> Result<(), CrawlError> {
        let timeout = self.config.challenge_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.fetcher.challenge_cleared().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Challenge poll failed"),
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(CrawlError::ChallengeTimeout(timeout));
            }
            tokio::time::sleep(self.config.challenge_poll().min(deadline - now)).await;
        }
    }

    /// 有限次重新登录, 两次之间冷却
    async fn reauthenticate(&self) -> Result<(), CrawlError> {
        let attempts = self.config.reauth_max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.fetcher.reauthenticate().await {
                Ok(()) => {
                    info!(attempt, "Re-authenticated");
                    return Ok(());
                }
                Err(FetchError::Fatal(reason)) => return Err(CrawlError::Fatal(reason)),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Re-authentication failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reauth_cooldown()).await;
                    }
                }
            }
        }
        Err(CrawlError::AuthExhausted { attempts })
    }

    async fn human_pause(&self) {
        let (min, max) = (self.config.page_pause_min_ms, self.config.page_pause_max_ms);
        let millis = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    async fn persist(&self, state: &CrawlState) -> Result<(), CrawlError> {
        self.store.persist(state).await.map_err(CrawlError::from)
    }

    /// 记录停止原因并落盘; 返回原错误 (落盘失败时返回落盘错误)
    async fn stop(&mut self, state: CrawlState, err: CrawlError) -> CrawlError {
        if !matches!(err, CrawlError::Cancelled) {
            self.transition(CrawlPhase::FatalError);
            error!(business_date = %state.business_date, error = %err, "Crawl stopped, state is resumable");
        } else {
            info!(business_date = %state.business_date, "Crawl cancelled between pages");
        }
        let state = state.mark_stopped(err.to_string());
        match self.persist(&state).await {
            Ok(()) => err,
            Err(persist_err) => persist_err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::fetcher::MemoryFetcher;
    use crate::models::{DomBlock, NextPage};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn fast_config() -> CrawlConfig {
        CrawlConfig {
            max_retries_per_page: 3,
            backoff_base_ms: 1,
            backoff_multiplier: 2.0,
            backoff_ceiling_ms: 4,
            fetch_timeout_ms: 1_000,
            challenge_timeout_secs: 0,
            challenge_poll_ms: 1,
            reauth_max_attempts: 2,
            reauth_cooldown_secs: 0,
            max_pages: 0,
            max_consecutive_gave_up: 3,
            verification_passes: 0,
            page_pause_min_ms: 0,
            page_pause_max_ms: 0,
        }
    }

    fn block(id: &str, order: i64) -> DomBlock {
        DomBlock {
            order_header: Some(format!("Order #{order}")),
            meta_ids: vec![format!("ID: {id}")],
            ..Default::default()
        }
    }

    fn page(blocks: Vec<DomBlock>, next: NextPage) -> FetchedPage {
        FetchedPage {
            blocks,
            next,
            ..Default::default()
        }
    }

    fn crawler(fetcher: Arc<MemoryFetcher>, dir: &std::path::Path, config: CrawlConfig) -> DateCrawler {
        DateCrawler::new(fetcher, StateStore::new(dir), config)
    }

    #[tokio::test]
    async fn crawls_until_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::with_pages([
            (1, page(vec![block("a", 1), block("b", 2)], NextPage::More)),
            (2, page(vec![block("c", 3)], NextPage::End)),
        ]));
        let mut crawler = crawler(fetcher.clone(), dir.path(), fast_config());

        let outcome = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert!(outcome.state.terminal);
        assert_eq!(outcome.state.records.len(), 3);
        assert_eq!(outcome.pages_parsed, vec![1, 2]);
        assert_eq!(fetcher.fetch_log(), vec![1, 2]);
        assert_eq!(crawler.phase(), CrawlPhase::Terminal);
    }

    #[tokio::test]
    async fn bad_blocks_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = DomBlock {
            meta_ids: vec!["ID: orphan".into()],
            ..Default::default()
        };
        let fetcher = Arc::new(MemoryFetcher::with_pages([(
            1,
            page(vec![block("a", 1), DomBlock::default(), orphan], NextPage::End),
        )]));
        let mut crawler = crawler(fetcher, dir.path(), fast_config());

        let outcome = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome.state.records.len(), 1);
        assert_eq!(outcome.state.crawl_summary().blocks_skipped, 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_on_the_same_page() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::with_pages([(
            1,
            page(vec![block("a", 1)], NextPage::End),
        )]));
        fetcher.script(1, Err(FetchError::Transient("reset".into())));
        fetcher.script(1, Err(FetchError::Throttled { retry_after: None }));
        let mut crawler = crawler(fetcher.clone(), dir.path(), fast_config());

        let outcome = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_log(), vec![1, 1, 1]);
        assert_eq!(outcome.state.records["a"].capture_attempt, 3);
        assert!(outcome.state.pending_retries.is_empty());
        assert!(!outcome.state.is_incomplete());
    }

    #[tokio::test]
    async fn challenge_timeout_is_fatal_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.script(1, Err(FetchError::ChallengeDetected));
        fetcher.script_challenge_polls([false]);
        let mut crawler = crawler(fetcher, dir.path(), fast_config());

        let err = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::ChallengeTimeout(_)));
        assert_eq!(crawler.phase(), CrawlPhase::FatalError);

        let saved = StateStore::new(dir.path()).load(date()).await.unwrap().unwrap();
        assert!(!saved.terminal);
        assert!(saved.stop.is_some());
    }

    #[tokio::test]
    async fn challenge_that_clears_does_not_consume_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::with_pages([(
            1,
            page(vec![block("a", 1)], NextPage::End),
        )]));
        fetcher.script(1, Err(FetchError::ChallengeDetected));
        fetcher.script_challenge_polls([true]);
        let mut crawler = crawler(fetcher, dir.path(), fast_config());

        let outcome = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome.state.records["a"].capture_attempt, 1);
    }

    #[tokio::test]
    async fn auth_expiry_reauthenticates_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::with_pages([(
            1,
            page(vec![block("a", 1)], NextPage::End),
        )]));
        fetcher.script(1, Err(FetchError::AuthExpired));
        let mut ok_crawler = crawler(fetcher.clone(), dir.path(), fast_config());
        let outcome = ok_crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(fetcher.reauth_calls(), 1);
        assert_eq!(outcome.state.records.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let failing = Arc::new(MemoryFetcher::new());
        failing.script(1, Err(FetchError::AuthExpired));
        failing.script_reauth(Err(FetchError::AuthExpired));
        failing.script_reauth(Err(FetchError::AuthExpired));
        let mut bad_crawler = crawler(failing.clone(), dir.path(), fast_config());
        let err = bad_crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::AuthExhausted { attempts: 2 }));
        assert_eq!(failing.reauth_calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_is_honoured_between_pages() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::with_pages([(
            1,
            page(vec![block("a", 1)], NextPage::End),
        )]));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut crawler = crawler(fetcher.clone(), dir.path(), fast_config());

        let err = crawler.run(CrawlState::new(date(), "t"), &cancel).await.unwrap_err();
        assert!(matches!(err, CrawlError::Cancelled));
        assert!(fetcher.fetch_log().is_empty());
    }

    #[tokio::test]
    async fn repeated_page_signature_ends_pass_as_stalled() {
        let dir = tempfile::tempdir().unwrap();
        let same = page(vec![block("a", 1), block("b", 1)], NextPage::More);
        let fetcher = Arc::new(MemoryFetcher::with_pages([(1, same.clone()), (2, same)]));
        let mut crawler = crawler(fetcher.clone(), dir.path(), fast_config());

        let outcome = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_log(), vec![1, 2]);
        assert!(outcome.state.is_incomplete());
        assert_eq!(outcome.state.records.len(), 2);
    }

    #[tokio::test]
    async fn consecutive_gave_up_pages_end_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        for page in 1..=3 {
            for _ in 0..3 {
                fetcher.script(page, Err(FetchError::Throttled { retry_after: None }));
            }
        }
        let mut crawler = crawler(fetcher.clone(), dir.path(), fast_config());

        let outcome = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert!(outcome.state.terminal);
        assert_eq!(outcome.state.pages_gave_up.len(), 3);
        assert_eq!(fetcher.fetch_log().len(), 9);
    }

    #[tokio::test]
    async fn slow_fetches_time_out_and_exhaust_the_page_budget() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(
            MemoryFetcher::with_pages([(1, page(vec![block("a", 1)], NextPage::End))])
                .with_latency(Duration::from_millis(50)),
        );
        let config = CrawlConfig {
            fetch_timeout_ms: 5,
            max_consecutive_gave_up: 1,
            ..fast_config()
        };
        let mut crawler = crawler(fetcher.clone(), dir.path(), config);

        let outcome = crawler
            .run(CrawlState::new(date(), "t"), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_log(), vec![1, 1, 1]);
        assert!(outcome.state.records.is_empty());
        assert!(outcome.state.pages_gave_up.contains(&1));
        assert!(outcome.state.pending_retries.is_empty());
        assert!(outcome.state.page_errors[&1].contains("timed out"));
        assert!(outcome.state.is_incomplete());

        let saved = StateStore::new(dir.path()).load(date()).await.unwrap().unwrap();
        assert!(saved.pages_gave_up.contains(&1));
        assert!(saved.page_errors[&1].contains("timed out"));
    }
}
