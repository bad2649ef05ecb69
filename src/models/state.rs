use std::collections::{BTreeMap, BTreeSet};

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::check::CheckRecord;
use super::page::{OrderAggregate, PaginationSummary};
use super::report::CrawlSummary;

/// 状态文件格式版本; 只允许追加字段
pub const STATE_VERSION: u32 = 1;

/// 页签名取前几个 payment_id
pub const SIGNATURE_LEN: usize = 6;

fn state_version() -> u32 {
    STATE_VERSION
}

fn first_pass() -> u32 {
    1
}

/// 单页的重试计数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub count: u32,
    pub next_eligible_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// 日期被标记为不完整的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncompleteReason {
    PageGaveUp { page: u32 },
    /// 分页不再前进 (与之前某页签名重复)
    PaginationStalled { page: u32, repeats: u32 },
    /// 分页摘要给出的总数多于实际采到的 id
    PaginationShortfall { expected: u32, collected: u32 },
}

/// 一轮遍历中各订单出现过的 payment_id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassObservation {
    pub pass: u32,
    #[serde(default)]
    pub ids_by_order: BTreeMap<i64, BTreeSet<String>>,
    /// 本轮首次出现的 id 数
    #[serde(default)]
    pub new_ids: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRecord {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// 一页解析完成后要并入状态的内容
#[derive(Debug, Clone, Default)]
pub struct PageMerge {
    pub page: u32,
    pub records: Vec<CheckRecord>,
    pub order_totals: Vec<OrderAggregate>,
    pub pagination: Option<PaginationSummary>,
    pub blocks_skipped: usize,
    pub is_last: bool,
    /// 与之前第几页签名相同
    pub stalled_on: Option<u32>,
}

/// 单日爬取的可续跑状态
///
/// 每次变更都消费旧值并返回新值, 由调用方先持久化新值再替换。
/// 记录与进度写在同一个文件里, 页进度和记录要么同时落盘要么都不落盘。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlState {
    #[serde(default = "state_version")]
    pub version: u32,
    pub business_date: NaiveDate,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// 当前轮次, 从 1 开始
    #[serde(default = "first_pass")]
    pub pass: u32,
    /// 当前轮次内已完成的页
    #[serde(default)]
    pub pages_completed: BTreeSet<u32>,
    #[serde(default)]
    pub pages_gave_up: BTreeSet<u32>,
    #[serde(default)]
    pub payment_ids_seen: BTreeSet<String>,
    #[serde(default)]
    pub pending_retries: BTreeMap<u32, RetryEntry>,
    #[serde(default)]
    pub terminal: bool,

    /// 当前轮次已知的最后一页
    #[serde(default)]
    pub end_page: Option<u32>,
    #[serde(default)]
    pub page_signatures: BTreeMap<u32, Vec<String>>,
    #[serde(default)]
    pub pagination_total: Option<u32>,
    #[serde(default)]
    pub incomplete_reasons: Vec<IncompleteReason>,
    #[serde(default)]
    pub skipped_by_page: BTreeMap<u32, usize>,
    /// 各页最近一次抓取失败原因 (诊断用, 成功合并后清除)
    #[serde(default)]
    pub page_errors: BTreeMap<u32, String>,

    #[serde(default)]
    pub current_pass: PassObservation,
    /// 已结束轮次的观测
    #[serde(default)]
    pub passes: Vec<PassObservation>,
    #[serde(default)]
    pub order_totals: BTreeMap<i64, BigDecimal>,
    /// payment_id -> 记录, 后写覆盖
    #[serde(default)]
    pub records: IndexMap<String, CheckRecord>,
    #[serde(default)]
    pub stop: Option<StopRecord>,
}

impl CrawlState {
    pub fn new(business_date: NaiveDate, run_id: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            business_date,
            run_id: run_id.into(),
            updated_at: None,
            pass: 1,
            pages_completed: BTreeSet::new(),
            pages_gave_up: BTreeSet::new(),
            payment_ids_seen: BTreeSet::new(),
            pending_retries: BTreeMap::new(),
            terminal: false,
            end_page: None,
            page_signatures: BTreeMap::new(),
            pagination_total: None,
            incomplete_reasons: Vec::new(),
            skipped_by_page: BTreeMap::new(),
            page_errors: BTreeMap::new(),
            current_pass: PassObservation {
                pass: 1,
                ..Default::default()
            },
            passes: Vec::new(),
            order_totals: BTreeMap::new(),
            records: IndexMap::new(),
            stop: None,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        !self.incomplete_reasons.is_empty()
    }

    /// 当前轮次是否已经走到已知末页
    pub fn pass_exhausted(&self, cursor: u32) -> bool {
        matches!(self.end_page, Some(end) if cursor > end)
    }

    /// 签名与本轮之前某页完全相同时返回那一页
    pub fn repeated_signature(&self, page: u32, signature: &[String]) -> Option<u32> {
        if signature.is_empty() {
            return None;
        }
        self.page_signatures
            .iter()
            .find(|(p, sig)| **p != page && sig.as_slice() == signature)
            .map(|(p, _)| *p)
    }

    /// 已结束轮次 + 当前轮次
    pub fn all_passes(&self) -> Vec<PassObservation> {
        let mut passes = self.passes.clone();
        if !self.terminal && !self.current_pass.ids_by_order.is_empty() {
            passes.push(self.current_pass.clone());
        }
        passes
    }

    pub fn records_vec(&self) -> Vec<CheckRecord> {
        self.records.values().cloned().collect()
    }

    pub fn crawl_summary(&self) -> CrawlSummary {
        CrawlSummary {
            pages_completed: self.pages_completed.iter().copied().collect(),
            pages_gave_up: self.pages_gave_up.iter().copied().collect(),
            passes: self.passes.len() as u32,
            incomplete: self.is_incomplete(),
            incomplete_reasons: self.incomplete_reasons.clone(),
            blocks_skipped: self.skipped_by_page.values().sum(),
        }
    }

    fn touch(mut self) -> Self {
        self.updated_at = Some(Utc::now());
        self
    }

    fn push_reason(&mut self, reason: IncompleteReason) {
        if !self.incomplete_reasons.contains(&reason) {
            self.incomplete_reasons.push(reason);
        }
    }

    /// 恢复运行: 清除上次的停止原因
    pub fn resume(mut self) -> Self {
        self.stop = None;
        self.touch()
    }

    /// 合并一页: 记录按 payment_id 后写覆盖, 页进度与记录一起提交
    pub fn merge_page(mut self, merge: PageMerge) -> Self {
        let page = merge.page;
        let signature: Vec<String> = merge
            .records
            .iter()
            .take(SIGNATURE_LEN)
            .map(|r| r.payment_id.clone())
            .collect();

        for record in merge.records {
            self.payment_ids_seen.insert(record.payment_id.clone());
            self.current_pass
                .ids_by_order
                .entry(record.order_number)
                .or_default()
                .insert(record.payment_id.clone());
            self.records.insert(record.payment_id.clone(), record);
        }
        for aggregate in merge.order_totals {
            self.order_totals
                .insert(aggregate.order_number, aggregate.total);
        }
        if let Some(pagination) = merge.pagination {
            self.pagination_total = Some(pagination.total);
        }

        self.page_signatures.insert(page, signature);
        self.skipped_by_page.insert(page, merge.blocks_skipped);
        self.pages_completed.insert(page);
        self.pages_gave_up.remove(&page);
        self.pending_retries.remove(&page);
        self.page_errors.remove(&page);
        self.incomplete_reasons
            .retain(|r| *r != IncompleteReason::PageGaveUp { page });

        if let Some(repeats) = merge.stalled_on {
            self.push_reason(IncompleteReason::PaginationStalled { page, repeats });
            self.end_page = Some(page);
        } else if merge.is_last {
            // 本轮未停滞地走到了末页, 之前轮次的停滞不再成立
            self.incomplete_reasons
                .retain(|r| !matches!(r, IncompleteReason::PaginationStalled { .. }));
            self.end_page = Some(page);
        }
        self.touch()
    }

    pub fn record_retry(mut self, page: u32, entry: RetryEntry) -> Self {
        if let Some(error) = &entry.last_error {
            self.page_errors.insert(page, error.clone());
        }
        self.pending_retries.insert(page, entry);
        self.touch()
    }

    /// 放弃该页: 继续爬取, 但日期标记为不完整
    pub fn give_up_page(mut self, page: u32, last_error: &str) -> Self {
        self.page_errors.insert(page, last_error.to_string());
        self.pending_retries.remove(&page);
        self.pages_gave_up.insert(page);
        self.push_reason(IncompleteReason::PageGaveUp { page });
        self.touch()
    }

    /// 结束当前轮次; 仍有轮次且本轮有新 id 时进入下一轮, 否则终止
    pub fn close_pass(mut self, max_passes: u32) -> Self {
        let mut earlier: BTreeSet<&String> = BTreeSet::new();
        for pass in &self.passes {
            for ids in pass.ids_by_order.values() {
                earlier.extend(ids.iter());
            }
        }
        let mut observation = std::mem::take(&mut self.current_pass);
        observation.pass = self.pass;
        observation.new_ids = observation
            .ids_by_order
            .values()
            .flat_map(|ids| ids.iter())
            .filter(|id| !earlier.contains(id))
            .count();
        let new_ids = observation.new_ids;
        self.passes.push(observation);

        self.incomplete_reasons
            .retain(|r| !matches!(r, IncompleteReason::PaginationShortfall { .. }));
        if let Some(expected) = self.pagination_total {
            let collected = self.payment_ids_seen.len() as u32;
            if collected < expected {
                self.push_reason(IncompleteReason::PaginationShortfall { expected, collected });
            }
        }

        if self.pass < max_passes && new_ids > 0 {
            self.pass += 1;
            self.current_pass = PassObservation {
                pass: self.pass,
                ..Default::default()
            };
            self.pages_completed.clear();
            self.pending_retries.clear();
            self.page_signatures.clear();
            self.end_page = None;
        } else {
            self.terminal = true;
        }
        self.touch()
    }

    pub fn mark_stopped(mut self, reason: impl Into<String>) -> Self {
        self.stop = Some(StopRecord {
            reason: reason.into(),
            at: Utc::now(),
        });
        self.touch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::check::ValidationOutcome;
    use bigdecimal::Zero;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn record(id: &str, order: i64, page: u32) -> CheckRecord {
        CheckRecord {
            payment_id: id.to_string(),
            order_number: order,
            business_date: date(),
            check_number: None,
            subtotal: None,
            tax: None,
            tip: None,
            gratuity: None,
            discount: BigDecimal::zero(),
            total: None,
            line_items: vec![],
            payments: vec![],
            discounts: vec![],
            table_label: None,
            guest_count: None,
            revenue_center: None,
            server: None,
            time_opened: None,
            time_closed: None,
            turnover_minutes: None,
            capture_page: page,
            capture_attempt: 1,
            capture_pass: 1,
            reconciliation_status: None,
            validation: ValidationOutcome::default(),
        }
    }

    #[test]
    fn merge_overwrites_by_payment_id() {
        let state = CrawlState::new(date(), "run")
            .merge_page(PageMerge {
                page: 1,
                records: vec![record("a", 1, 1), record("b", 2, 1)],
                ..Default::default()
            })
            .merge_page(PageMerge {
                page: 2,
                records: vec![record("a", 1, 2)],
                ..Default::default()
            });

        assert_eq!(state.records.len(), 2);
        assert_eq!(state.records["a"].capture_page, 2);
        assert_eq!(state.pages_completed, BTreeSet::from([1, 2]));
    }

    #[test]
    fn later_success_clears_gave_up_flag() {
        let state = CrawlState::new(date(), "run").give_up_page(3, "throttled by portal");
        assert!(state.is_incomplete());
        assert_eq!(state.page_errors[&3], "throttled by portal");

        let state = state.merge_page(PageMerge {
            page: 3,
            records: vec![record("c", 9, 3)],
            ..Default::default()
        });
        assert!(!state.is_incomplete());
        assert!(state.pages_gave_up.is_empty());
        assert!(state.page_errors.is_empty());
    }

    #[test]
    fn clean_later_pass_clears_earlier_stall() {
        let state = CrawlState::new(date(), "run")
            .merge_page(PageMerge {
                page: 1,
                records: vec![record("a", 1, 1)],
                ..Default::default()
            })
            .merge_page(PageMerge {
                page: 2,
                records: vec![record("a", 1, 2)],
                stalled_on: Some(1),
                ..Default::default()
            });
        assert!(state.is_incomplete());
        assert_eq!(state.end_page, Some(2));

        let state = state.close_pass(2);
        assert_eq!(state.pass, 2);
        assert!(state.is_incomplete());

        let state = state
            .merge_page(PageMerge {
                page: 1,
                records: vec![record("a", 1, 1)],
                ..Default::default()
            })
            .merge_page(PageMerge {
                page: 2,
                records: vec![record("b", 1, 2)],
                is_last: true,
                ..Default::default()
            });
        assert!(!state.is_incomplete());
        assert_eq!(state.end_page, Some(2));
    }

    #[test]
    fn stall_on_the_last_page_stays_flagged() {
        let state = CrawlState::new(date(), "run")
            .merge_page(PageMerge {
                page: 1,
                records: vec![record("a", 1, 1)],
                ..Default::default()
            })
            .merge_page(PageMerge {
                page: 2,
                records: vec![record("a", 1, 2)],
                stalled_on: Some(1),
                is_last: true,
                ..Default::default()
            });
        assert_eq!(
            state.incomplete_reasons,
            vec![IncompleteReason::PaginationStalled { page: 2, repeats: 1 }]
        );
    }

    #[test]
    fn close_pass_advances_only_when_new_ids_found() {
        let state = CrawlState::new(date(), "run")
            .merge_page(PageMerge {
                page: 1,
                records: vec![record("a", 1, 1)],
                is_last: true,
                ..Default::default()
            })
            .close_pass(2);
        assert_eq!(state.pass, 2);
        assert!(!state.terminal);
        assert!(state.pages_completed.is_empty());

        let state = state
            .merge_page(PageMerge {
                page: 1,
                records: vec![record("a", 1, 1)],
                is_last: true,
                ..Default::default()
            })
            .close_pass(3);
        assert!(state.terminal);
        assert_eq!(state.passes.len(), 2);
        assert_eq!(state.passes[1].new_ids, 0);
    }

    #[test]
    fn shortfall_against_pagination_total_is_flagged() {
        let state = CrawlState::new(date(), "run")
            .merge_page(PageMerge {
                page: 1,
                records: vec![record("a", 1, 1)],
                pagination: Some(PaginationSummary { start: 1, end: 2, total: 2 }),
                is_last: true,
                ..Default::default()
            })
            .close_pass(1);
        assert_eq!(
            state.incomplete_reasons,
            vec![IncompleteReason::PaginationShortfall { expected: 2, collected: 1 }]
        );
    }

    #[test]
    fn state_with_unknown_fields_still_loads() {
        let json = r#"{"business_date":"2025-03-14","pages_completed":[1,2],"terminal":false,"future_field":42}"#;
        let state: CrawlState = serde_json::from_str(json).unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.pass, 1);
        assert_eq!(state.pages_completed.len(), 2);
    }
}
