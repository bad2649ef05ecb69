use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::check::CheckRecord;
use super::state::IncompleteReason;

/// 订单对账状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Complete,
    Partial,
    Unknown,
    Single,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Unknown => "unknown",
            Self::Single => "single",
        }
    }
}

/// 支撑状态判断的证据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// 小计之和低于订单合计
    AmountUndershoot { gap: BigDecimal },
    /// 小计之和高于订单合计 (证据矛盾)
    AmountOvershoot { gap: BigDecimal },
    AmountMatched,
    /// 第 pass 轮出现了新的 payment_id
    NewChecksInPass { pass: u32, new_ids: Vec<String> },
    /// 最后一轮仍有新 payment_id, 尚未收敛
    PassesNotConverged,
    /// 唯一被捕获的 check 为全额招待
    LoneComped,
}

/// 同一 (business_date, order_number) 的 check 集合, 对账后派生
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderGroup {
    pub business_date: NaiveDate,
    pub order_number: i64,
    pub payment_ids: Vec<String>,
    pub captured_check_count: usize,
    pub expected_check_count: usize,
    pub reconciliation_status: ReconciliationStatus,
    pub captured_subtotal: BigDecimal,
    pub order_level_total: Option<BigDecimal>,
    pub amount_gap: Option<BigDecimal>,
    pub evidence: Vec<Evidence>,
}

impl OrderGroup {
    pub fn to_row(&self) -> ReconciliationRow {
        ReconciliationRow {
            business_date: self.business_date,
            order_number: self.order_number,
            captured_check_count: self.captured_check_count,
            expected_check_count: self.expected_check_count,
            reconciliation_status: self.reconciliation_status,
            amount_gap: self.amount_gap.clone(),
        }
    }
}

/// 对账报告行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRow {
    pub business_date: NaiveDate,
    pub order_number: i64,
    pub captured_check_count: usize,
    pub expected_check_count: usize,
    pub reconciliation_status: ReconciliationStatus,
    pub amount_gap: Option<BigDecimal>,
}

/// 单日爬取概况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub pages_completed: Vec<u32>,
    pub pages_gave_up: Vec<u32>,
    pub passes: u32,
    pub incomplete: bool,
    pub incomplete_reasons: Vec<IncompleteReason>,
    pub blocks_skipped: usize,
}

/// 单日最终产出: 注解后的记录 + 订单对账报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateReport {
    pub business_date: NaiveDate,
    pub crawl: CrawlSummary,
    pub orders: Vec<ReconciliationRow>,
    pub records: Vec<CheckRecord>,
    pub validation_failures: usize,
}

impl DateReport {
    pub fn count_status(&self, status: ReconciliationStatus) -> usize {
        self.orders
            .iter()
            .filter(|o| o.reconciliation_status == status)
            .count()
    }

    /// 区分 "一切正常" 与 "部分日期/订单不完整"
    pub fn has_issues(&self) -> bool {
        self.crawl.incomplete
            || self.validation_failures > 0
            || self.count_status(ReconciliationStatus::Partial) > 0
            || self.count_status(ReconciliationStatus::Unknown) > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStatus {
    Clean,
    /// 有放弃的页、未完成订单或校验失败
    Incomplete,
    /// 运行级失败, 状态文件可续跑
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateSummary {
    pub business_date: NaiveDate,
    pub status: DateStatus,
    pub checks: usize,
    pub partial_orders: usize,
    pub unknown_orders: usize,
    pub validation_failures: usize,
    pub error: Option<String>,
}

impl DateSummary {
    pub fn from_report(report: &DateReport) -> Self {
        Self {
            business_date: report.business_date,
            status: if report.has_issues() {
                DateStatus::Incomplete
            } else {
                DateStatus::Clean
            },
            checks: report.records.len(),
            partial_orders: report.count_status(ReconciliationStatus::Partial),
            unknown_orders: report.count_status(ReconciliationStatus::Unknown),
            validation_failures: report.validation_failures,
            error: None,
        }
    }

    pub fn failed(business_date: NaiveDate, error: String) -> Self {
        Self {
            business_date,
            status: DateStatus::Failed,
            checks: 0,
            partial_orders: 0,
            unknown_orders: 0,
            validation_failures: 0,
            error: Some(error),
        }
    }
}

/// 多日运行汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub dates: Vec<DateSummary>,
}

impl RunSummary {
    pub fn all_clean(&self) -> bool {
        self.dates.iter().all(|d| d.status == DateStatus::Clean)
    }

    pub fn count(&self, status: DateStatus) -> usize {
        self.dates.iter().filter(|d| d.status == status).count()
    }
}
