mod common;

use std::sync::Arc;
use std::time::Duration;

use check_extract_rust::error::{CrawlError, FetchError};
use check_extract_rust::fetcher::MemoryFetcher;
use check_extract_rust::models::{DateStatus, FetchedPage, NextPage};
use check_extract_rust::{CancelFlag, RangeRunner, StateStore};
use common::*;

fn three_pages() -> Vec<(u32, FetchedPage)> {
    vec![
        (
            1,
            page(
                vec![
                    check("a", 1, "10.00", "0.80", "2.00", "12.80"),
                    check("b", 4, "14.00", "1.12", "0.00", "15.12"),
                ],
                NextPage::More,
            ),
        ),
        (2, page(vec![check("c", 2, "30.00", "2.40", "5.00", "37.40")], NextPage::More)),
        (3, page(vec![check("d", 3, "8.00", "0.64", "0.00", "8.64")], NextPage::End)),
    ]
}

/// 每页一个 check, 最后一页为末页
fn numbered_pages(count: u32) -> Vec<(u32, FetchedPage)> {
    (1..=count)
        .map(|n| {
            let next = if n == count { NextPage::End } else { NextPage::More };
            let id = format!("p{n}");
            (n, page(vec![check(&id, n as i64, "10.00", "0.80", "0.00", "10.80")], next))
        })
        .collect()
}

#[tokio::test]
async fn concurrent_runs_of_one_date_do_not_share_the_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        MemoryFetcher::with_pages(numbered_pages(20)).with_latency(Duration::from_millis(5)),
    );
    let pipeline = pipeline(fetcher.clone(), dir.path(), &fast_config(0));
    let cancel = CancelFlag::new();

    let (first, second) = tokio::join!(
        pipeline.run_date(date(), &cancel),
        pipeline.run_date(date(), &cancel)
    );

    let report = first.unwrap();
    assert_eq!(report.records.len(), 20);
    assert!(matches!(second, Err(CrawlError::AlreadyRunning(d)) if d == date()));
    // 每页只抓一次
    assert_eq!(fetcher.fetch_log(), (1..=20).collect::<Vec<_>>());
    assert!(!dir.path().join(format!("state_{}.json.tmp", date())).exists());

    // 占用已释放, 终态日期可再次运行
    let again = pipeline.run_date(date(), &cancel).await.unwrap();
    assert_eq!(again.records, report.records);
    assert_eq!(fetcher.fetch_log().len(), 20);
}

#[tokio::test]
async fn duplicate_date_in_a_range_is_reported_as_already_running() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        MemoryFetcher::with_pages(numbered_pages(5)).with_latency(Duration::from_millis(5)),
    );
    let pipeline = Arc::new(common::pipeline(fetcher.clone(), dir.path(), &fast_config(0)));
    let runner = RangeRunner::new(pipeline, 2);

    let summary = runner.run(vec![date(), date()], &CancelFlag::new()).await;

    assert_eq!(summary.dates.len(), 2);
    assert_eq!(summary.count(DateStatus::Clean), 1);
    assert_eq!(summary.count(DateStatus::Failed), 1);
    let failed = summary
        .dates
        .iter()
        .find(|d| d.status == DateStatus::Failed)
        .unwrap();
    assert!(failed.error.as_deref().unwrap_or_default().contains("already running"));
    assert_eq!(fetcher.fetch_log(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn resumed_run_fetches_only_remaining_pages_and_matches_uninterrupted() {
    let config = fast_config(0);

    let interrupted_dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(MemoryFetcher::with_pages(three_pages()));
    fetcher.script(2, Err(FetchError::Fatal("browser crashed".into())));
    let pipeline = pipeline(fetcher.clone(), interrupted_dir.path(), &config);

    let first = pipeline.run_date(date(), &CancelFlag::new()).await;
    assert!(matches!(first, Err(CrawlError::Fatal(_))));

    let saved = StateStore::new(interrupted_dir.path())
        .load(date())
        .await
        .unwrap()
        .unwrap();
    assert!(!saved.terminal);
    assert!(saved.pages_completed.contains(&1));
    assert!(!saved.pages_completed.contains(&2));
    assert!(saved.stop.is_some());

    let resumed = pipeline.run_date(date(), &CancelFlag::new()).await.unwrap();
    assert_eq!(fetcher.fetch_log(), vec![1, 2, 2, 3]);

    let clean_dir = tempfile::tempdir().unwrap();
    let uninterrupted = common::pipeline(
        Arc::new(MemoryFetcher::with_pages(three_pages())),
        clean_dir.path(),
        &config,
    )
    .run_date(date(), &CancelFlag::new())
    .await
    .unwrap();

    assert_eq!(resumed.records, uninterrupted.records);
    assert_eq!(resumed.orders, uninterrupted.orders);
    assert_eq!(resumed.crawl, uninterrupted.crawl);
}

#[tokio::test]
async fn rerun_of_terminal_date_is_a_no_op_with_identical_records() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(MemoryFetcher::with_pages(three_pages()));
    let pipeline = pipeline(fetcher.clone(), dir.path(), &fast_config(1));

    let first = pipeline.run_date(date(), &CancelFlag::new()).await.unwrap();
    let fetches = fetcher.fetch_log().len();
    let second = pipeline.run_date(date(), &CancelFlag::new()).await.unwrap();

    assert_eq!(fetcher.fetch_log().len(), fetches);
    assert_eq!(first, second);

    let fresh_dir = tempfile::tempdir().unwrap();
    let fresh = common::pipeline(
        Arc::new(MemoryFetcher::with_pages(three_pages())),
        fresh_dir.path(),
        &fast_config(1),
    )
    .run_date(date(), &CancelFlag::new())
    .await
    .unwrap();
    let ids = |records: &[check_extract_rust::models::CheckRecord]| {
        records.iter().map(|r| r.payment_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first.records), ids(&fresh.records));
    assert_eq!(first.records, fresh.records);
}

#[tokio::test]
async fn cancelled_run_keeps_state_for_resume() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(MemoryFetcher::with_pages(three_pages()));
    let pipeline = pipeline(fetcher.clone(), dir.path(), &fast_config(0));

    let cancel = CancelFlag::new();
    cancel.cancel();
    let result = pipeline.run_date(date(), &cancel).await;
    assert!(matches!(result, Err(CrawlError::Cancelled)));
    assert!(fetcher.fetch_log().is_empty());

    let report = pipeline.run_date(date(), &CancelFlag::new()).await.unwrap();
    assert_eq!(report.records.len(), 4);
}

#[tokio::test]
async fn range_runner_reports_each_date_and_isolates_failures() {
    let state_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(MemoryFetcher::with_pages(three_pages()));
    // 最先抓取第 1 页的那个日期失败
    fetcher.script(1, Err(FetchError::Fatal("portal error".into())));

    let pipeline = Arc::new(common::pipeline(fetcher, state_dir.path(), &fast_config(0)));
    let runner = RangeRunner::new(pipeline, 2).with_output_dir(output_dir.path());
    let dates = check_extract_rust::service::dates_between(
        date(),
        date().succ_opt().unwrap().succ_opt().unwrap(),
    )
    .unwrap();

    let summary = runner.run(dates.clone(), &CancelFlag::new()).await;

    assert_eq!(summary.dates.len(), 3);
    let listed: Vec<_> = summary.dates.iter().map(|d| d.business_date).collect();
    assert_eq!(listed, dates);
    assert_eq!(summary.count(DateStatus::Failed), 1);
    assert_eq!(summary.count(DateStatus::Clean), 2);
    assert!(!summary.all_clean());

    for day in summary.dates.iter().filter(|d| d.status == DateStatus::Clean) {
        assert_eq!(day.checks, 4);
        assert!(runner.report(day.business_date).is_some());
        assert!(output_dir
            .path()
            .join(format!("report_{}.json", day.business_date))
            .exists());
        assert!(output_dir
            .path()
            .join(format!("reconciliation_{}.csv", day.business_date))
            .exists());
    }
    let failed = summary
        .dates
        .iter()
        .find(|d| d.status == DateStatus::Failed)
        .unwrap();
    assert!(runner.report(failed.business_date).is_none());
    assert!(failed.error.as_deref().unwrap_or_default().contains("portal error"));
}
