//! 逐条算术校验: 只标注, 不修正

use bigdecimal::{BigDecimal, Zero};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::models::{CheckRecord, FieldMismatch, ValidationOutcome};

#[derive(Debug, Clone)]
pub struct Validator {
    absolute_tolerance: BigDecimal,
    relative_tolerance: BigDecimal,
}

impl Validator {
    pub fn new(absolute_tolerance: BigDecimal, relative_tolerance: BigDecimal) -> Self {
        Self {
            absolute_tolerance,
            relative_tolerance,
        }
    }

    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(
            config.absolute_tolerance.clone(),
            config.relative_tolerance.clone(),
        )
    }

    /// 容差 = max(绝对容差, 相对容差 * |期望值|)
    fn tolerance_for(&self, expected: &BigDecimal) -> BigDecimal {
        let relative = &self.relative_tolerance * &expected.abs();
        if relative > self.absolute_tolerance {
            relative
        } else {
            self.absolute_tolerance.clone()
        }
    }

    fn within(&self, expected: &BigDecimal, actual: &BigDecimal) -> bool {
        (expected - actual).abs() <= self.tolerance_for(expected)
    }

    /// 校验单条记录, 结果写入 `record.validation`; 返回是否失败
    ///
    /// - total ≈ subtotal + tax + tip + gratuity - discount (tip/gratuity 缺失按 0)
    /// - line_total ≈ quantity * unit_price - 行折扣
    pub fn validate_record(&self, record: &mut CheckRecord) -> bool {
        let mut outcome = ValidationOutcome::default();

        let missing: Vec<&str> = [
            ("subtotal", record.subtotal.is_none()),
            ("tax", record.tax.is_none()),
            ("total", record.total.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();

        match (&record.subtotal, &record.tax, &record.total) {
            (Some(subtotal), Some(tax), Some(total)) => {
                let zero = BigDecimal::zero();
                let tip = record.tip.as_ref().unwrap_or(&zero);
                let gratuity = record.gratuity.as_ref().unwrap_or(&zero);
                let expected = (subtotal + tax + tip + gratuity - &record.discount).round(2);
                if !self.within(&expected, total) {
                    outcome.mismatches.push(FieldMismatch {
                        field: "total".to_string(),
                        expected,
                        actual: total.clone(),
                    });
                }
            }
            _ => outcome.unchecked.push(format!("total (missing {})", missing.join(", "))),
        }

        for (index, item) in record.line_items.iter().enumerate() {
            let field = format!("line_items[{index}].line_total");
            match (&item.quantity, &item.unit_price, &item.line_total) {
                (Some(quantity), Some(unit_price), Some(line_total)) => {
                    let expected = (quantity * unit_price - &item.discount).round(2);
                    if !self.within(&expected, line_total) {
                        outcome.mismatches.push(FieldMismatch {
                            field,
                            expected,
                            actual: line_total.clone(),
                        });
                    }
                }
                _ => outcome.unchecked.push(field),
            }
        }

        outcome.validation_failed = !outcome.mismatches.is_empty();
        if outcome.validation_failed {
            warn!(
                payment_id = %record.payment_id,
                order_number = record.order_number,
                fields = ?outcome.mismatches.iter().map(|m| m.field.as_str()).collect::<Vec<_>>(),
                "Validation mismatch"
            );
        } else if !outcome.unchecked.is_empty() {
            debug!(payment_id = %record.payment_id, unchecked = ?outcome.unchecked, "Validation skipped fields");
        }

        let failed = outcome.validation_failed;
        record.validation = outcome;
        failed
    }

    /// 并行校验一批记录, 返回失败条数
    pub fn validate_all(&self, records: &mut [CheckRecord]) -> usize {
        records
            .par_iter_mut()
            .map(|record| self.validate_record(record))
            .filter(|failed| *failed)
            .count()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::from_config(&ValidationConfig::default())
    }
}
