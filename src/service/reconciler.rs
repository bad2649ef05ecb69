//! Order Reconciler: 按订单号分组, 推断每个订单的 check 是否采全
//!
//! 证据优先级: 订单级合计 (金额) > 多轮遍历新增的 payment_id (计数) > 无证据 (unknown)。
//! 只给记录加注解, 不删除也不修改记录本身的字段。

use std::collections::{BTreeMap, BTreeSet};

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::models::{
    CheckRecord, Evidence, OrderGroup, PassObservation, ReconciliationRow, ReconciliationStatus,
};

/// 对账结果: 分组报告 + 注解后的记录
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub business_date: NaiveDate,
    pub groups: Vec<OrderGroup>,
    pub records: Vec<CheckRecord>,
}

impl Reconciliation {
    pub fn rows(&self) -> Vec<ReconciliationRow> {
        self.groups.iter().map(OrderGroup::to_row).collect()
    }

    pub fn group(&self, order_number: i64) -> Option<&OrderGroup> {
        self.groups.iter().find(|g| g.order_number == order_number)
    }
}

/// 金额交叉核对的结论
#[derive(Debug, Clone, PartialEq)]
enum AmountSignal {
    Undershoot(BigDecimal),
    Overshoot(BigDecimal),
    Matched,
    Unavailable,
}

/// 多轮遍历对某订单的观测
#[derive(Debug, Default)]
struct PassSignal {
    /// 各轮累计出现过的 id 数的最大值
    expected: usize,
    /// 第一轮之后出现过新 id
    revised: bool,
    /// 最后一轮仍有新 id
    still_growing: bool,
    evidence: Vec<Evidence>,
}

#[derive(Debug, Clone)]
pub struct OrderReconciler {
    amount_tolerance: BigDecimal,
}

impl OrderReconciler {
    pub fn new(amount_tolerance: BigDecimal) -> Self {
        Self { amount_tolerance }
    }

    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(config.amount_tolerance.clone())
    }

    /// 对某营业日的全部记录做对账
    ///
    /// 只能在该日所有页都已完成或放弃之后调用。
    pub fn reconcile(
        &self,
        business_date: NaiveDate,
        records: Vec<CheckRecord>,
        passes: &[PassObservation],
        order_totals: &BTreeMap<i64, BigDecimal>,
    ) -> Reconciliation {
        // 同一 payment_id 只保留最后一条
        let mut by_id: IndexMap<String, CheckRecord> = IndexMap::with_capacity(records.len());
        for record in records {
            by_id.insert(record.payment_id.clone(), record);
        }
        let mut records: Vec<CheckRecord> = by_id.into_values().collect();

        let mut orders: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            orders.entry(record.order_number).or_default().push(index);
        }

        let mut groups = Vec::with_capacity(orders.len());
        for (order_number, members) in &orders {
            let group_records: Vec<&CheckRecord> = members.iter().map(|&i| &records[i]).collect();
            let group = self.assess(
                business_date,
                *order_number,
                &group_records,
                passes,
                order_totals.get(order_number),
            );
            for &i in members {
                records[i].reconciliation_status = Some(group.reconciliation_status);
            }
            groups.push(group);
        }

        let count = |status: ReconciliationStatus| {
            groups
                .iter()
                .filter(|g| g.reconciliation_status == status)
                .count()
        };
        info!(
            %business_date,
            orders = groups.len(),
            checks = records.len(),
            complete = count(ReconciliationStatus::Complete),
            single = count(ReconciliationStatus::Single),
            partial = count(ReconciliationStatus::Partial),
            unknown = count(ReconciliationStatus::Unknown),
            "Reconciliation finished"
        );

        Reconciliation {
            business_date,
            groups,
            records,
        }
    }

    fn assess(
        &self,
        business_date: NaiveDate,
        order_number: i64,
        records: &[&CheckRecord],
        passes: &[PassObservation],
        order_total: Option<&BigDecimal>,
    ) -> OrderGroup {
        let captured = records.len();
        let captured_subtotal: BigDecimal = records.iter().map(|r| r.subtotal_or_zero()).sum();
        let has_comped = records.iter().any(|r| r.is_comped());

        let pass_signal = pass_signal(order_number, passes);
        let mut evidence = pass_signal.evidence.clone();

        let amount_gap = order_total.map(|total| total - &captured_subtotal);
        let amount = match &amount_gap {
            None => AmountSignal::Unavailable,
            Some(gap) if *gap > self.amount_tolerance => AmountSignal::Undershoot(gap.clone()),
            Some(gap) if *gap < -self.amount_tolerance.clone() => AmountSignal::Overshoot(gap.clone()),
            Some(_) => AmountSignal::Matched,
        };

        let mut expected = captured.max(pass_signal.expected);
        match &amount {
            AmountSignal::Undershoot(gap) => {
                expected = expected.max(captured + 1);
                evidence.push(Evidence::AmountUndershoot { gap: gap.clone() });
            }
            AmountSignal::Overshoot(gap) => evidence.push(Evidence::AmountOvershoot { gap: gap.clone() }),
            AmountSignal::Matched => evidence.push(Evidence::AmountMatched),
            AmountSignal::Unavailable => {}
        }
        if pass_signal.still_growing {
            evidence.push(Evidence::PassesNotConverged);
        }

        let undershoot = matches!(amount, AmountSignal::Undershoot(_))
            || pass_signal.still_growing
            || expected > captured;

        let status = if undershoot {
            ReconciliationStatus::Partial
        } else if matches!(amount, AmountSignal::Overshoot(_)) {
            warn!(
                %business_date,
                order_number,
                captured_subtotal = %captured_subtotal,
                order_total = ?order_total.map(|t| t.to_string()),
                "Captured subtotals exceed order total, evidence contradicts"
            );
            ReconciliationStatus::Unknown
        } else if captured == 1 {
            if amount == AmountSignal::Unavailable && has_comped {
                // 单独被捕获的全额招待 check 不能代表整个订单
                evidence.push(Evidence::LoneComped);
                ReconciliationStatus::Unknown
            } else {
                ReconciliationStatus::Single
            }
        } else if amount == AmountSignal::Matched {
            ReconciliationStatus::Complete
        } else if pass_signal.revised && !has_comped {
            ReconciliationStatus::Complete
        } else {
            ReconciliationStatus::Unknown
        };

        if status == ReconciliationStatus::Partial {
            warn!(
                %business_date,
                order_number,
                captured,
                expected,
                amount_gap = ?amount_gap.as_ref().map(|g| g.to_string()),
                "Order is partially captured"
            );
        } else {
            debug!(%business_date, order_number, captured, expected, status = status.as_str(), "Order assessed");
        }

        OrderGroup {
            business_date,
            order_number,
            payment_ids: records.iter().map(|r| r.payment_id.clone()).collect(),
            captured_check_count: captured,
            expected_check_count: expected,
            reconciliation_status: status,
            captured_subtotal,
            order_level_total: order_total.cloned(),
            amount_gap,
            evidence,
        }
    }
}

/// 累计各轮出现的 id: 第一轮之后的新 id 说明上调了期望数量
fn pass_signal(order_number: i64, passes: &[PassObservation]) -> PassSignal {
    let mut signal = PassSignal::default();
    let mut seen: BTreeSet<&String> = BTreeSet::new();
    for (index, pass) in passes.iter().enumerate() {
        let Some(ids) = pass.ids_by_order.get(&order_number) else {
            continue;
        };
        let new_ids: Vec<String> = ids.iter().filter(|id| !seen.contains(id)).cloned().collect();
        let grew = !new_ids.is_empty();
        if index > 0 && grew {
            signal.revised = true;
            signal.evidence.push(Evidence::NewChecksInPass {
                pass: pass.pass,
                new_ids,
            });
        }
        if index > 0 && index == passes.len() - 1 {
            signal.still_growing = grew;
        }
        seen.extend(ids.iter());
        signal.expected = signal.expected.max(seen.len());
    }
    signal
}

impl Default for OrderReconciler {
    fn default() -> Self {
        Self::from_config(&ReconcileConfig::default())
    }
}
