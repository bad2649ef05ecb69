use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::report::ReconciliationStatus;

/// 检查记录 (一个 block 对应一张 check)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub payment_id: String,
    pub order_number: i64,
    pub business_date: NaiveDate,
    #[serde(default)]
    pub check_number: Option<i64>,

    // 金额 (缺失为 None, discount 缺失为 0)
    #[serde(default)]
    pub subtotal: Option<BigDecimal>,
    #[serde(default)]
    pub tax: Option<BigDecimal>,
    #[serde(default)]
    pub tip: Option<BigDecimal>,
    #[serde(default)]
    pub gratuity: Option<BigDecimal>,
    #[serde(default = "BigDecimal::zero")]
    pub discount: BigDecimal,
    #[serde(default)]
    pub total: Option<BigDecimal>,

    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub payments: Vec<PaymentLine>,
    #[serde(default)]
    pub discounts: Vec<DiscountLine>,

    // 描述字段, 不参与对账
    #[serde(default)]
    pub table_label: Option<String>,
    #[serde(default)]
    pub guest_count: Option<i32>,
    #[serde(default)]
    pub revenue_center: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub time_opened: Option<String>,
    #[serde(default)]
    pub time_closed: Option<String>,
    #[serde(default)]
    pub turnover_minutes: Option<BigDecimal>,

    // 来源 (仅用于诊断)
    pub capture_page: u32,
    pub capture_attempt: u32,
    #[serde(default)]
    pub capture_pass: u32,

    // 注解
    #[serde(default)]
    pub reconciliation_status: Option<ReconciliationStatus>,
    #[serde(default)]
    pub validation: ValidationOutcome,
}

impl CheckRecord {
    /// 对账用的小计, 缺失按 0 计
    pub fn subtotal_or_zero(&self) -> BigDecimal {
        self.subtotal.clone().unwrap_or_else(BigDecimal::zero)
    }

    /// 全额折扣/招待的 check
    pub fn is_comped(&self) -> bool {
        self.subtotal_or_zero().is_zero()
    }
}

/// 明细行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub menu_item_name: String,
    #[serde(default)]
    pub modifiers: Option<String>,
    /// 可能为小数, 例如 0.5 (分享菜)
    #[serde(default)]
    pub quantity: Option<BigDecimal>,
    #[serde(default)]
    pub unit_price: Option<BigDecimal>,
    #[serde(default = "BigDecimal::zero")]
    pub discount: BigDecimal,
    #[serde(default)]
    pub line_total: Option<BigDecimal>,
    #[serde(default)]
    pub line_tax: Option<BigDecimal>,
    #[serde(default)]
    pub voided: bool,
    #[serde(default)]
    pub void_reason: Option<String>,
}

/// 支付明细
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentLine {
    pub payment_type: Option<String>,
    pub payment_date: Option<String>,
    pub amount: Option<BigDecimal>,
    pub tip: Option<BigDecimal>,
    pub gratuity: Option<BigDecimal>,
    pub total: Option<BigDecimal>,
    pub refund: Option<BigDecimal>,
    pub status: Option<String>,
    pub card_type: Option<String>,
    pub card_last_4: Option<String>,
}

/// 折扣明细
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountLine {
    pub name: Option<String>,
    pub amount: BigDecimal,
    pub applied_date: Option<String>,
    pub approver: Option<String>,
    pub reason: Option<String>,
}

/// 校验结果 (只报告, 不修正)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub validation_failed: bool,
    #[serde(default)]
    pub mismatches: Vec<FieldMismatch>,
    /// 缺少输入而无法校验的字段
    #[serde(default)]
    pub unchecked: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub field: String,
    pub expected: BigDecimal,
    pub actual: BigDecimal,
}
