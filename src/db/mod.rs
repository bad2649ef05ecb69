//! Loader 边界: 以 (business_date, payment_id) 幂等写入 Postgres, 以及 CSV 导出

pub mod pool;
pub mod queries;

pub use pool::create_pool;
pub use queries::{ensure_schema, export_report_csv, upsert_checks, upsert_reconciliation};
