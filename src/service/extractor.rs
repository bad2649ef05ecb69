//! Block Extractor: 一个 DOM 块 -> 一条 CheckRecord
//!
//! 纯函数; 可选字段缺失时取 None/0, 只有缺少 payment_id 或订单号才放弃整块。

use std::str::FromStr;
use std::sync::OnceLock;

use bigdecimal::{BigDecimal, Zero};
use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use regex::Regex;

use crate::error::ExtractionError;
use crate::models::{
    CheckRecord, DiscountLine, DomBlock, DomTable, LineItem, PaymentLine, ValidationOutcome,
};

/// 块所在页的上下文
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub business_date: NaiveDate,
    pub page: u32,
    pub attempt: u32,
    pub pass: u32,
    /// 页面级订单头, 块自身没有时使用
    pub page_order_header: Option<&'a str>,
}

const DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y, %I:%M:%S %p",
    "%m/%d/%Y, %I:%M %p",
    "%m/%d/%y, %I:%M:%S %p",
    "%m/%d/%y, %I:%M %p",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%y %I:%M %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%b %d, %Y %I:%M:%S %p",
    "%b %d, %Y %I:%M %p",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

struct Patterns {
    meta_id: Regex,
    reopen_id: Regex,
    order_number: Regex,
    check_number: Vec<Regex>,
    time_opened: Vec<Regex>,
    guest_count: Vec<Regex>,
    server: Vec<Regex>,
    table: Vec<Regex>,
    revenue_center: Vec<Regex>,
    subtotal: Vec<Regex>,
    tax: Vec<Regex>,
    tip: Vec<Regex>,
    gratuity: Vec<Regex>,
    total: Vec<Regex>,
    card_last_4: Vec<Regex>,
    card_type: Regex,
}

fn compile(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).expect("static pattern")
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| compile(p)).collect()
}

/// 标签在下一行时 ("Server:\nAlice") 优先匹配换行形式
fn label_patterns(label: &str, value: &str) -> Vec<Regex> {
    vec![
        compile(&format!(r"{label}\s*[:\-]?\s*\r?\n\s*({value})")),
        compile(&format!(r"{label}\s*[:\-]?\s*({value})")),
    ]
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        meta_id: compile(r"\bID\s*:\s*([A-Za-z0-9_\-]+)"),
        reopen_id: compile(r"reopencheck\?id=([^&\s]+)"),
        order_number: compile(r"Order\s*#\s*(\d+)"),
        check_number: compile_all(&[r"check\s*#?\s*(\d+)"]),
        time_opened: label_patterns("(?:time opened|opened)", r"[0-9/:\sapmAPM,]+"),
        guest_count: label_patterns("(?:guest count|guests?|covers?)", r"\d+"),
        server: label_patterns("server", r"[^\n]+"),
        table: label_patterns("table", r"[^\n]+"),
        revenue_center: label_patterns("revenue center", r"[^\n]+"),
        subtotal: compile_all(&[r"subtotal\s*:?\s*\$?\s*([0-9,]+\.\d{2})"]),
        tax: compile_all(&[r"\btax\b\s*:?\s*\$?\s*([0-9,]+\.\d{2})"]),
        tip: compile_all(&[r"\btip\b\s*:?\s*\$?\s*([0-9,]+\.\d{2})"]),
        gratuity: compile_all(&[r"gratuity\s*:?\s*\$?\s*([0-9,]+\.\d{2})"]),
        total: compile_all(&[
            r"\btotal\b\s*:?\s*\$?\s*([0-9,]+\.\d{2})",
            r"\btotal\b\s*:\s*(?:[A-Za-z ]+:\s*)*\$?\s*([0-9,]+\.\d{2})",
        ]),
        card_last_4: compile_all(&[r"(?:\*{4}|x{4}|ending in)\s*(\d{4})", r"\b(\d{4})\b"]),
        card_type: compile(r"(?:credit|debit)\s*:\s*([A-Za-z]+)"),
    })
}

/// 解析一个检查块
pub fn extract_block(block: &DomBlock, ctx: &BlockContext<'_>) -> Result<CheckRecord, ExtractionError> {
    let pats = patterns();
    let payment_id = payment_id(block, pats).ok_or_else(|| ExtractionError::MalformedBlock {
        reason: "no payment id in meta id or reopen form".to_string(),
    })?;
    let order_number = order_number(block, ctx, pats).ok_or_else(|| {
        ExtractionError::MissingOrderContext {
            payment_id: payment_id.clone(),
        }
    })?;

    let body = block.body_text.as_str();
    let pairs = &block.pairs;
    let summary = &block.summary;

    let line_items = extract_line_items(&block.tables);
    let payments = extract_payments(&block.tables, pats);
    let discounts = extract_discounts(&block.tables);

    let subtotal = amount(&summary.subtotal)
        .or_else(|| amount_from(pick_pair(pairs, &["subtotal"], &[])))
        .or_else(|| amount_from(regex_pick(body, &pats.subtotal)));

    let tip = amount(&summary.tip)
        .or_else(|| sum_present(payments.iter().map(|p| &p.tip)))
        .or_else(|| amount_from(pick_pair(pairs, &["tip"], &[])))
        .or_else(|| amount_from(regex_pick(body, &pats.tip)));

    let gratuity = amount(&summary.gratuity)
        .or_else(|| sum_present(payments.iter().map(|p| &p.gratuity)))
        .or_else(|| amount_from(pick_pair(pairs, &["gratuity", "service charge"], &[])))
        .or_else(|| amount_from(regex_pick(body, &pats.gratuity)));

    let total = amount(&summary.total)
        .or_else(|| amount_from(pick_pair(pairs, &["total"], &["subtotal"])))
        .or_else(|| amount_from(regex_pick(body, &pats.total)))
        .or_else(|| sum_present(payments.iter().map(|p| &p.total)))
        .or_else(|| {
            sum_present(payments.iter().map(|p| &p.amount)).map(|paid| {
                paid + tip.clone().unwrap_or_default() + gratuity.clone().unwrap_or_default()
            })
        });

    let discount = amount(&summary.discount)
        .or_else(|| amount_from(pick_pair(pairs, &["discount"], &[])))
        .or_else(|| {
            if discounts.is_empty() {
                None
            } else {
                Some(discounts.iter().map(|d| d.amount.clone()).sum())
            }
        })
        .unwrap_or_else(BigDecimal::zero);

    let tax = amount(&summary.tax)
        .or_else(|| amount_from(pick_pair(pairs, &["tax"], &["pre-tax", "pretax"])))
        .or_else(|| amount_from(regex_pick(body, &pats.tax)))
        .or_else(|| derive_tax(&subtotal, &total, &tip, &gratuity, &discount))
        .map(|t| if t.abs() < BigDecimal::new(5.into(), 3) { BigDecimal::zero() } else { t });

    let check_number = pick_pair(pairs, &["check #", "check number"], &[])
        .and_then(|v| parse_int(&v))
        .or_else(|| regex_pick(body, &pats.check_number).and_then(|v| parse_int(&v)));

    let details = &block.details;
    let time_opened = pick_pair(pairs, &["time opened", "opened", "open time"], &[])
        .or_else(|| non_empty(&details.time_opened))
        .or_else(|| regex_pick(body, &pats.time_opened));
    let guest_count = pick_pair(pairs, &["guest", "covers"], &[])
        .or_else(|| non_empty(&details.guest_count))
        .or_else(|| regex_pick(body, &pats.guest_count))
        .and_then(|v| parse_int(&v))
        .and_then(|v| i32::try_from(v).ok());
    let server = non_empty(&details.server)
        .and_then(|v| sanitize_server(&v))
        .or_else(|| pick_pair(pairs, &["server"], &[]).and_then(|v| sanitize_server(&v)))
        .or_else(|| regex_pick(body, &pats.server).and_then(|v| sanitize_server(&v)));
    let table_label = non_empty(&details.table)
        .or_else(|| pick_pair(pairs, &["table"], &[]))
        .or_else(|| regex_pick(body, &pats.table));
    let revenue_center = non_empty(&details.revenue_center)
        .or_else(|| pick_pair(pairs, &["revenue center"], &[]))
        .or_else(|| regex_pick(body, &pats.revenue_center));

    let time_closed = payments.iter().find_map(|p| p.payment_date.clone());
    let turnover_minutes = match (&time_opened, &time_closed) {
        (Some(opened), Some(closed)) => turnover_minutes(opened, closed),
        _ => None,
    };

    Ok(CheckRecord {
        payment_id,
        order_number,
        business_date: ctx.business_date,
        check_number,
        subtotal,
        tax,
        tip,
        gratuity,
        discount,
        total,
        line_items,
        payments,
        discounts,
        table_label,
        guest_count,
        revenue_center,
        server,
        time_opened,
        time_closed,
        turnover_minutes,
        capture_page: ctx.page,
        capture_attempt: ctx.attempt,
        capture_pass: ctx.pass,
        reconciliation_status: None,
        validation: ValidationOutcome::default(),
    })
}

fn payment_id(block: &DomBlock, pats: &Patterns) -> Option<String> {
    block
        .meta_ids
        .iter()
        .find_map(|text| pats.meta_id.captures(text).map(|c| c[1].to_string()))
        .or_else(|| {
            block
                .reopen_action
                .as_deref()
                .and_then(|action| pats.reopen_id.captures(action))
                .map(|c| c[1].to_string())
        })
}

fn order_number(block: &DomBlock, ctx: &BlockContext<'_>, pats: &Patterns) -> Option<i64> {
    let from_header = |text: &str| {
        pats.order_number
            .captures(text)
            .and_then(|c| c[1].parse::<i64>().ok())
    };
    block
        .order_header
        .as_deref()
        .and_then(from_header)
        .or_else(|| ctx.page_order_header.and_then(from_header))
        .or_else(|| {
            pick_pair(&block.pairs, &["order #", "order number"], &[]).and_then(|v| parse_int(&v))
        })
}

/// 去掉货币符号/千分位等, 只保留数字、小数点和负号
pub fn parse_decimal(text: &str) -> Option<BigDecimal> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if matches!(cleaned.as_str(), "" | "-" | "." | "-.") {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

fn parse_int(text: &str) -> Option<i64> {
    let digits: String = text
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}

fn amount(cell: &Option<String>) -> Option<BigDecimal> {
    cell.as_deref().and_then(parse_decimal)
}

fn amount_from(text: Option<String>) -> Option<BigDecimal> {
    text.as_deref().and_then(parse_decimal)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn sum_present<'a>(values: impl Iterator<Item = &'a Option<BigDecimal>>) -> Option<BigDecimal> {
    let present: Vec<&BigDecimal> = values.flatten().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.into_iter().cloned().sum())
    }
}

/// total - subtotal - tip - gratuity; 有折扣时小计口径不明, 不推导
fn derive_tax(
    subtotal: &Option<BigDecimal>,
    total: &Option<BigDecimal>,
    tip: &Option<BigDecimal>,
    gratuity: &Option<BigDecimal>,
    discount: &BigDecimal,
) -> Option<BigDecimal> {
    if !discount.is_zero() {
        return None;
    }
    let (subtotal, total) = (subtotal.as_ref()?, total.as_ref()?);
    let computed = total - subtotal
        - tip.clone().unwrap_or_default()
        - gratuity.clone().unwrap_or_default();
    (computed >= BigDecimal::zero()).then_some(computed)
}

/// 标签包含候选词 (忽略大小写) 且值非空; 先精确匹配再包含匹配
fn pick_pair(pairs: &IndexMap<String, String>, candidates: &[&str], exclude: &[&str]) -> Option<String> {
    let usable = |key: &str, value: &str| {
        !value.trim().is_empty() && !exclude.iter().any(|e| key.contains(e))
    };
    for candidate in candidates {
        for (key, value) in pairs {
            let key = normalize_label(key);
            if key == *candidate && usable(&key, value) {
                return Some(value.trim().to_string());
            }
        }
    }
    for (key, value) in pairs {
        let key = normalize_label(key);
        if candidates.iter().any(|c| key.contains(c)) && usable(&key, value) {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn normalize_label(label: &str) -> String {
    label.trim().trim_end_matches(':').trim().to_lowercase()
}

fn regex_pick(text: &str, patterns: &[Regex]) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// 表头归一化: 小写, 非字母数字变空格
fn normalize_header(value: &str) -> String {
    value
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 一行: 归一化表头 -> 单元格
struct Row(Vec<(String, String)>);

impl Row {
    fn new(headers: &[String], cells: &[String]) -> Self {
        Row(headers
            .iter()
            .zip(cells.iter())
            .map(|(h, c)| (h.clone(), c.clone()))
            .collect())
    }

    fn pick(&self, candidates: &[&str]) -> Option<String> {
        candidates.iter().find_map(|candidate| {
            let needle = normalize_header(candidate);
            self.0
                .iter()
                .find(|(key, value)| {
                    (key == &needle || key.contains(&needle)) && !value.trim().is_empty()
                })
                .map(|(_, value)| value.trim().to_string())
        })
    }

    fn pick_where(&self, predicate: impl Fn(&str) -> bool) -> Option<String> {
        self.0
            .iter()
            .find(|(key, value)| predicate(key.as_str()) && !value.trim().is_empty())
            .map(|(_, value)| value.trim().to_string())
    }

    fn decimal(&self, candidates: &[&str], predicate: impl Fn(&str) -> bool) -> Option<BigDecimal> {
        self.pick(candidates)
            .or_else(|| self.pick_where(predicate))
            .as_deref()
            .and_then(parse_decimal)
    }
}

fn headers_of(table: &DomTable) -> Vec<String> {
    table.headers.iter().map(|h| normalize_header(h)).collect()
}

/// 第一个同时有菜品列和数量列的表
fn extract_line_items(tables: &[DomTable]) -> Vec<LineItem> {
    for table in tables {
        let headers = headers_of(table);
        let has_item = headers.iter().any(|h| h.contains("item") || h.contains("menu"));
        let has_qty = headers.iter().any(|h| h.contains("qty") || h.contains("quantity"));
        if !(has_item && has_qty) {
            continue;
        }

        let items: Vec<LineItem> = table
            .rows
            .iter()
            .filter_map(|cells| {
                let row = Row::new(&headers, cells);
                let menu_item_name = row
                    .pick(&["menu item", "item", "item name", "menu"])
                    .or_else(|| row.pick_where(|k| k.contains("item")))?;
                let quantity = row.decimal(&["qty", "quantity", "item qty"], |k| k.contains("qty"));
                let unit_price = row.decimal(&["price", "unit price", "avg price"], |k| k.contains("price"));
                let discount = row
                    .decimal(&["discount", "discount amount"], |k| k == "discount")
                    .unwrap_or_else(BigDecimal::zero);
                let line_total = row
                    .decimal(&["net", "line total", "subtotal"], |k| k == "net")
                    .or_else(|| match (&quantity, &unit_price) {
                        (Some(q), Some(p)) => Some(q * p - &discount),
                        _ => None,
                    });
                let line_tax = row.decimal(&["tax", "item tax"], |k| k.contains("tax"));
                let voided = row
                    .pick(&["voided", "void"])
                    .map(|v| matches!(v.to_lowercase().as_str(), "true" | "yes" | "1"))
                    .unwrap_or(false);
                Some(LineItem {
                    menu_item_name,
                    modifiers: row.pick(&["modifiers", "modifier"]),
                    quantity,
                    unit_price,
                    discount,
                    line_total,
                    line_tax,
                    voided,
                    void_reason: row.pick(&["void reason", "reason"]),
                })
            })
            .collect();
        if !items.is_empty() {
            return items;
        }
    }
    Vec::new()
}

fn normalize_payment_type(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();
    let normalized = if lowered.contains("gift") && lowered.contains("card") {
        "Gift Card"
    } else if lowered.contains("credit") {
        "credit"
    } else if lowered.contains("debit") {
        "debit"
    } else if lowered.contains("cash") {
        "cash"
    } else {
        return Some(text);
    };
    Some(normalized.to_string())
}

fn extract_payments(tables: &[DomTable], pats: &Patterns) -> Vec<PaymentLine> {
    for table in tables {
        let headers = headers_of(table);
        let has_payment = headers
            .iter()
            .any(|h| h.contains("payment") || h.contains("method") || h.contains("card"));
        let has_amount = headers.iter().any(|h| h.contains("amount") || h.contains("total"));
        if !(has_payment && has_amount) {
            continue;
        }

        let payments: Vec<PaymentLine> = table
            .rows
            .iter()
            .map(|cells| {
                let row = Row::new(&headers, cells);
                let raw_type = row
                    .pick(&["payment", "payment method", "method", "type"])
                    .or_else(|| row.pick_where(|k| k.contains("payment") || k.contains("method")));
                let payment_type = raw_type.as_deref().and_then(normalize_payment_type);

                let mut card_type = row
                    .pick(&["card type"])
                    .or_else(|| row.pick_where(|k| k.contains("card") && !k.contains("last")));
                let mut card_last_4 = row.pick(&["card last 4", "last 4"]);
                if let Some(raw) = raw_type.as_deref() {
                    if card_last_4.is_none() {
                        card_last_4 = regex_pick(raw, &pats.card_last_4);
                    }
                    if card_type.is_none() {
                        card_type = pats.card_type.captures(raw).map(|c| c[1].to_string());
                    }
                }
                if payment_type.as_deref() == Some("Gift Card") {
                    card_type = None;
                    card_last_4 = None;
                }

                PaymentLine {
                    payment_date: row.pick(&["date", "paid at", "payment date"]),
                    amount: row.decimal(&["amount", "paid", "charge amount", "total"], |k| {
                        k.contains("amount") || k.contains("total")
                    }),
                    tip: row.decimal(&["tip"], |k| k.contains("tip")),
                    gratuity: row.decimal(&["gratuity", "service charge"], |k| k.contains("gratuity")),
                    total: row.decimal(&["total"], |k| k.contains("total")),
                    refund: row.decimal(&["refund"], |k| k.contains("refund")),
                    status: row.pick(&["status"]),
                    payment_type,
                    card_type,
                    card_last_4,
                }
            })
            .filter(|p| p.payment_type.is_some() || p.amount.is_some())
            .collect();
        if !payments.is_empty() {
            return payments;
        }
    }
    Vec::new()
}

/// 折扣表: 需要 name / amount / applied date 三列
fn extract_discounts(tables: &[DomTable]) -> Vec<DiscountLine> {
    for table in tables {
        let headers = headers_of(table);
        let has_name = headers.iter().any(|h| h.contains("name"));
        let has_amount = headers.iter().any(|h| h.contains("amount"));
        let has_applied = headers
            .iter()
            .any(|h| h.contains("applied") && h.contains("date"));
        if !(has_name && has_amount && has_applied) {
            continue;
        }

        let discounts: Vec<DiscountLine> = table
            .rows
            .iter()
            .map(|cells| {
                let row = Row::new(&headers, cells);
                DiscountLine {
                    name: row.pick(&["name"]),
                    amount: row
                        .pick(&["amount"])
                        .as_deref()
                        .and_then(parse_decimal)
                        .unwrap_or_else(BigDecimal::zero),
                    applied_date: row.pick(&["applied date", "date applied"]),
                    approver: row.pick(&["approver", "approved by"]),
                    reason: row.pick(&["reason"]),
                }
            })
            .collect();
        if !discounts.is_empty() {
            return discounts;
        }
    }
    Vec::new()
}

fn sanitize_server(raw: &str) -> Option<String> {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    let prefix = PREFIX.get_or_init(|| compile(r"^(?:opened by\s+server|server)\s*:\s*"));

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let text = prefix.replace(trimmed, "");
    let text = text.trim_matches(|c: char| c == ' ' || c == ':' || c == '-');

    let lowered = text.to_lowercase();
    if text.is_empty()
        || lowered.contains("station")
        || lowered.contains("device")
        || lowered.contains("opened by server")
        || (text.contains('(') && text.contains(')'))
        || matches!(lowered.as_str(), "none" | "null" | "n/a")
        || !text.chars().any(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }

    // "Ana Lee Ana Lee" -> "Ana Lee"
    let words: Vec<&str> = text.split(' ').collect();
    if words.len() >= 4 && words.len() % 2 == 0 {
        let half = words.len() / 2;
        if words[..half] == words[half..] {
            return Some(words[..half].join(" "));
        }
    }
    Some(text.to_string())
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let normalized = text.replace(" at ", " ");
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
}

/// 开台到首笔付款的分钟数, 保留两位小数
fn turnover_minutes(opened: &str, closed: &str) -> Option<BigDecimal> {
    let seconds = (parse_datetime(closed)? - parse_datetime(opened)?).num_seconds();
    if seconds < 0 {
        return None;
    }
    Some((BigDecimal::from(seconds) / BigDecimal::from(60)).round(2))
}
