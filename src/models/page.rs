use std::sync::OnceLock;

use bigdecimal::BigDecimal;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 浏览器层为每个 `.order-border` 块预解析出的 DOM 数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomBlock {
    /// 例如 "Order #106"
    #[serde(default)]
    pub order_header: Option<String>,
    /// 两列 tr / dl 中的 label -> value (先出现者优先)
    #[serde(default)]
    pub pairs: IndexMap<String, String>,
    #[serde(default)]
    pub tables: Vec<DomTable>,
    #[serde(default)]
    pub summary: SummaryCells,
    #[serde(default)]
    pub details: ServerDetails,
    /// `.order-detail-meta-id` 的文本, 如 "ID: 5f0c..."
    #[serde(default)]
    pub meta_ids: Vec<String>,
    /// `form[action*='reopencheck?id=']` 的 action
    #[serde(default)]
    pub reopen_action: Option<String>,
    #[serde(default)]
    pub body_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomTable {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

/// `.check-subtotal` 等汇总单元格的原始文本
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryCells {
    pub subtotal: Option<String>,
    pub tax: Option<String>,
    pub tip: Option<String>,
    pub gratuity: Option<String>,
    pub discount: Option<String>,
    pub credits: Option<String>,
    pub total: Option<String>,
}

/// `.check-server-details` 及相关输入框
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerDetails {
    pub time_opened: Option<String>,
    pub server: Option<String>,
    pub table: Option<String>,
    pub guest_count: Option<String>,
    pub revenue_center: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextPage {
    #[default]
    More,
    End,
}

/// 门户自身给出的订单级合计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAggregate {
    pub order_number: i64,
    pub total: BigDecimal,
}

/// "Showing x through y of z"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationSummary {
    pub start: u32,
    pub end: u32,
    pub total: u32,
}

impl PaginationSummary {
    pub fn parse(text: &str) -> Option<Self> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"(?i)Showing\s+(\d+)\s+through\s+(\d+)\s+of\s+(\d+)").expect("valid regex")
        });
        let caps = re.captures(text)?;
        Some(Self {
            start: caps[1].parse().ok()?,
            end: caps[2].parse().ok()?,
            total: caps[3].parse().ok()?,
        })
    }

    pub fn is_last_page(&self) -> bool {
        self.end >= self.total
    }
}

/// 一次成功抓取的页面
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    #[serde(default)]
    pub blocks: Vec<DomBlock>,
    #[serde(default)]
    pub next: NextPage,
    /// 页面级订单头 (所有 block 共享)
    #[serde(default)]
    pub order_header: Option<String>,
    #[serde(default)]
    pub pagination: Option<PaginationSummary>,
    #[serde(default)]
    pub order_totals: Vec<OrderAggregate>,
}

impl FetchedPage {
    /// 显式结束标记、空页或分页摘要已到末尾
    pub fn is_last(&self) -> bool {
        self.next == NextPage::End
            || self.blocks.is_empty()
            || self.pagination.map(|p| p.is_last_page()).unwrap_or(false)
    }
}
