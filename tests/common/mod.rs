#![allow(dead_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use check_extract_rust::config::{AppConfig, CrawlConfig};
use check_extract_rust::fetcher::MemoryFetcher;
use check_extract_rust::models::{DomBlock, FetchedPage, NextPage, OrderAggregate, SummaryCells};
use check_extract_rust::{DatePipeline, StateStore};

pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
}

pub fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

/// 毫秒级退避, 无页间停顿
pub fn fast_config(verification_passes: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.crawl = CrawlConfig {
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
        verification_passes,
        page_pause_min_ms: 0,
        page_pause_max_ms: 0,
    };
    config
}

/// 一个 check 块: subtotal / tax / tip / total 走汇总单元格
pub fn check(id: &str, order: i64, subtotal: &str, tax: &str, tip: &str, total: &str) -> DomBlock {
    DomBlock {
        order_header: Some(format!("Order #{order}")),
        meta_ids: vec![format!("ID: {id}")],
        summary: SummaryCells {
            subtotal: Some(format!("${subtotal}")),
            tax: Some(format!("${tax}")),
            tip: Some(format!("${tip}")),
            gratuity: Some("$0.00".to_string()),
            total: Some(format!("${total}")),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 全额招待的 check
pub fn comped(id: &str, order: i64, discount: &str) -> DomBlock {
    DomBlock {
        order_header: Some(format!("Order #{order}")),
        meta_ids: vec![format!("ID: {id}")],
        summary: SummaryCells {
            subtotal: Some("$0.00".to_string()),
            discount: Some(format!("${discount}")),
            total: Some("$0.00".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn page(blocks: Vec<DomBlock>, next: NextPage) -> FetchedPage {
    FetchedPage {
        blocks,
        next,
        ..Default::default()
    }
}

pub fn with_totals(mut page: FetchedPage, totals: &[(i64, &str)]) -> FetchedPage {
    page.order_totals = totals
        .iter()
        .map(|(order_number, total)| OrderAggregate {
            order_number: *order_number,
            total: dec(total),
        })
        .collect();
    page
}

pub fn pipeline(fetcher: Arc<MemoryFetcher>, dir: &Path, config: &AppConfig) -> DatePipeline {
    DatePipeline::new(fetcher, StateStore::new(dir), config)
}
