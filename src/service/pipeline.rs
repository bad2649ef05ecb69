//! 单日流水线 (爬取 -> 对账 -> 校验) 与多日并发调度

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::{DashMap, DashSet};
use futures::stream::{self, StreamExt};
use sqlx::PgPool;
use tracing::{error, info, info_span, warn, Instrument};

use super::crawler::{CancelFlag, DateCrawler};
use super::reconciler::OrderReconciler;
use super::validator::Validator;
use crate::config::{AppConfig, CrawlConfig};
use crate::db;
use crate::error::{AppError, CrawlError};
use crate::fetcher::PageFetcher;
use crate::models::{CrawlState, DateReport, DateStatus, DateSummary, RunSummary};
use crate::store::StateStore;

/// 单个营业日的完整处理
pub struct DatePipeline {
    fetcher: Arc<dyn PageFetcher>,
    store: StateStore,
    crawl: CrawlConfig,
    reconciler: OrderReconciler,
    validator: Validator,
    /// 正在爬取的日期; 同一日期同一时刻只允许一个爬取者写状态文件
    in_flight: DashSet<NaiveDate>,
}

/// 日期占用, 离开作用域时释放
struct DateLease<'a> {
    in_flight: &'a DashSet<NaiveDate>,
    business_date: NaiveDate,
}

impl<'a> DateLease<'a> {
    fn acquire(in_flight: &'a DashSet<NaiveDate>, business_date: NaiveDate) -> Option<Self> {
        in_flight.insert(business_date).then_some(Self {
            in_flight,
            business_date,
        })
    }
}

impl Drop for DateLease<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.business_date);
    }
}

impl DatePipeline {
    pub fn new(fetcher: Arc<dyn PageFetcher>, store: StateStore, config: &AppConfig) -> Self {
        Self {
            fetcher,
            store,
            crawl: config.crawl.clone(),
            reconciler: OrderReconciler::from_config(&config.reconcile),
            validator: Validator::from_config(&config.validation),
            in_flight: DashSet::new(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// 爬完 (或续跑) 某日, 然后对账并校验
    ///
    /// 只有爬取到达终态后才对账; 运行级失败直接返回错误, 状态文件保留可续跑。
    /// 同一日期已在爬取中时返回 `CrawlError::AlreadyRunning`, 不触碰状态文件。
    pub async fn run_date(
        &self,
        business_date: NaiveDate,
        cancel: &CancelFlag,
    ) -> Result<DateReport, CrawlError> {
        let Some(_lease) = DateLease::acquire(&self.in_flight, business_date) else {
            warn!(%business_date, "Date is already being crawled, rejecting second run");
            return Err(CrawlError::AlreadyRunning(business_date));
        };

        let span = info_span!("date", %business_date);
        async move {
            let run_id = Utc::now().format("%Y%m%dT%H%M%S").to_string();
            let state = self.store.load_or_new(business_date, &run_id).await?;

            let mut crawler =
                DateCrawler::new(self.fetcher.clone(), self.store.clone(), self.crawl.clone());
            let outcome = crawler.run(state, cancel).await?;
            info!(
                pages_parsed = outcome.pages_parsed.len(),
                records = outcome.state.records.len(),
                already_terminal = outcome.already_terminal,
                "Crawl finished"
            );

            Ok(self.build_report(&outcome.state))
        }
        .instrument(span)
        .await
    }

    /// 由终态的爬取状态生成报告 (纯计算, 可重复执行)
    pub fn build_report(&self, state: &CrawlState) -> DateReport {
        let reconciliation = self.reconciler.reconcile(
            state.business_date,
            state.records_vec(),
            &state.passes,
            &state.order_totals,
        );
        let orders = reconciliation.rows();
        let mut records = reconciliation.records;
        let validation_failures = self.validator.validate_all(&mut records);

        let crawl = state.crawl_summary();
        if crawl.incomplete {
            warn!(
                business_date = %state.business_date,
                reasons = ?crawl.incomplete_reasons,
                "Date is incomplete"
            );
        }

        DateReport {
            business_date: state.business_date,
            crawl,
            orders,
            records,
            validation_failures,
        }
    }
}

/// 多个营业日并发执行, 每个日期独占自己的状态文件
pub struct RangeRunner {
    pipeline: Arc<DatePipeline>,
    workers: usize,
    output_dir: Option<PathBuf>,
    pool: Option<PgPool>,
    reports: Arc<DashMap<NaiveDate, DateReport>>,
}

impl RangeRunner {
    pub fn new(pipeline: Arc<DatePipeline>, workers: usize) -> Self {
        Self {
            pipeline,
            workers: workers.max(1),
            output_dir: None,
            pool: None,
            reports: Arc::new(DashMap::new()),
        }
    }

    /// 每个日期完成后写出 JSON 报告与对账 CSV
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// 每个日期完成后 upsert 到 Postgres
    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// 最近一次运行产出的报告
    pub fn report(&self, business_date: NaiveDate) -> Option<DateReport> {
        self.reports.get(&business_date).map(|r| r.value().clone())
    }

    pub fn reports(&self) -> Arc<DashMap<NaiveDate, DateReport>> {
        self.reports.clone()
    }

    /// 按 `workers` 并发爬取; 单个日期失败不影响其他日期
    pub async fn run(&self, dates: Vec<NaiveDate>, cancel: &CancelFlag) -> RunSummary {
        info!(dates = dates.len(), workers = self.workers, "Starting range run");

        let mut dates: Vec<DateSummary> = stream::iter(dates)
            .map(|business_date| async move {
                match self.pipeline.run_date(business_date, cancel).await {
                    Ok(report) => self.finish(report).await,
                    Err(e) => {
                        error!(%business_date, error = %e, "Date failed, state file kept for resume");
                        DateSummary::failed(business_date, e.to_string())
                    }
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;
        dates.sort_by_key(|s| s.business_date);

        let summary = RunSummary { dates };
        info!(
            clean = summary.count(DateStatus::Clean),
            incomplete = summary.count(DateStatus::Incomplete),
            failed = summary.count(DateStatus::Failed),
            "Range run finished"
        );
        summary
    }

    async fn finish(&self, report: DateReport) -> DateSummary {
        let mut summary = DateSummary::from_report(&report);
        if let Err(e) = self.export(&report).await {
            warn!(business_date = %report.business_date, error = %e, "Report export failed");
            summary.error = Some(e.to_string());
        }
        self.reports.insert(report.business_date, report);
        summary
    }

    async fn export(&self, report: &DateReport) -> Result<(), AppError> {
        if let Some(dir) = &self.output_dir {
            tokio::fs::create_dir_all(dir).await?;
            let json_path = dir.join(format!("report_{}.json", report.business_date));
            tokio::fs::write(&json_path, serde_json::to_vec_pretty(report)?).await?;
            let csv_path = dir.join(format!("reconciliation_{}.csv", report.business_date));
            db::export_report_csv(&report.orders, &csv_path)?;
        }
        if let Some(pool) = &self.pool {
            db::upsert_checks(pool, &report.records).await?;
            db::upsert_reconciliation(pool, &report.orders).await?;
        }
        Ok(())
    }
}

/// 闭区间 [start, end] 内的每一天
pub fn dates_between(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>, AppError> {
    if end < start {
        return Err(AppError::InvalidRequest(format!(
            "end_date {end} is before start_date {start}"
        )));
    }
    Ok(start.iter_days().take_while(|d| *d <= end).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    #[test]
    fn dates_between_is_inclusive() {
        assert_eq!(dates_between(d(1), d(3)).unwrap(), vec![d(1), d(2), d(3)]);
        assert_eq!(dates_between(d(5), d(5)).unwrap(), vec![d(5)]);
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(matches!(
            dates_between(d(3), d(1)),
            Err(AppError::InvalidRequest(_))
        ));
    }
}
