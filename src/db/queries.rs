use crate::models::{CheckRecord, ReconciliationRow};
use bigdecimal::BigDecimal;
use sqlx::PgPool;
use std::path::Path;
use std::time::{Duration, Instant};

/// 每条 INSERT 的最大行数 (Postgres 单语句绑定参数上限 65535)
const CHUNK_ROWS: usize = 1000;
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// 建表 (幂等)
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pos_check (
            business_date   DATE        NOT NULL,
            payment_id      TEXT        NOT NULL,
            order_number    BIGINT      NOT NULL,
            check_number    BIGINT,
            subtotal        NUMERIC(12, 2),
            tax             NUMERIC(12, 2),
            tip             NUMERIC(12, 2),
            gratuity        NUMERIC(12, 2),
            discount        NUMERIC(12, 2) NOT NULL DEFAULT 0,
            total           NUMERIC(12, 2),
            table_label     TEXT,
            guest_count     INTEGER,
            revenue_center  TEXT,
            server_name     TEXT,
            time_opened     TEXT,
            time_closed     TEXT,
            turnover_minutes NUMERIC(10, 2),
            line_items      JSONB       NOT NULL DEFAULT '[]',
            payments        JSONB       NOT NULL DEFAULT '[]',
            discounts       JSONB       NOT NULL DEFAULT '[]',
            capture_page    INTEGER     NOT NULL,
            capture_attempt INTEGER     NOT NULL,
            capture_pass    INTEGER     NOT NULL,
            reconciliation_status TEXT,
            validation_failed BOOLEAN   NOT NULL DEFAULT FALSE,
            validation      JSONB       NOT NULL DEFAULT '{}',
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (business_date, payment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pos_order_reconciliation (
            business_date         DATE    NOT NULL,
            order_number          BIGINT  NOT NULL,
            captured_check_count  INTEGER NOT NULL,
            expected_check_count  INTEGER NOT NULL,
            reconciliation_status TEXT    NOT NULL,
            amount_gap            NUMERIC(12, 2),
            updated_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (business_date, order_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("✓ 表结构已就绪");
    Ok(())
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// 批量 upsert check 记录, 主键 (business_date, payment_id); 重跑时以新值覆盖
pub async fn upsert_checks(pool: &PgPool, records: &[CheckRecord]) -> Result<(), sqlx::Error> {
    if records.is_empty() {
        return Ok(());
    }

    for chunk in records.chunks(CHUNK_ROWS) {
        tracing::debug!("开始构建 check upsert 语句, {} 条记录", chunk.len());

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO pos_check (
                business_date, payment_id, order_number, check_number,
                subtotal, tax, tip, gratuity, discount, total,
                table_label, guest_count, revenue_center, server_name,
                time_opened, time_closed, turnover_minutes,
                line_items, payments, discounts,
                capture_page, capture_attempt, capture_pass,
                reconciliation_status, validation_failed, validation
            ) ",
        );

        query_builder.push_values(chunk, |mut b, record| {
            b.push_bind(record.business_date)
                .push_bind(&record.payment_id)
                .push_bind(record.order_number)
                .push_bind(record.check_number)
                .push_bind(record.subtotal.clone())
                .push_bind(record.tax.clone())
                .push_bind(record.tip.clone())
                .push_bind(record.gratuity.clone())
                .push_bind(record.discount.clone())
                .push_bind(record.total.clone())
                .push_bind(&record.table_label)
                .push_bind(record.guest_count)
                .push_bind(&record.revenue_center)
                .push_bind(&record.server)
                .push_bind(&record.time_opened)
                .push_bind(&record.time_closed)
                .push_bind(record.turnover_minutes.clone())
                .push_bind(to_json(&record.line_items))
                .push_unseparated("::jsonb")
                .push_bind(to_json(&record.payments))
                .push_unseparated("::jsonb")
                .push_bind(to_json(&record.discounts))
                .push_unseparated("::jsonb")
                .push_bind(record.capture_page as i32)
                .push_bind(record.capture_attempt as i32)
                .push_bind(record.capture_pass as i32)
                .push_bind(record.reconciliation_status.map(|s| s.as_str()))
                .push_bind(record.validation.validation_failed)
                .push_bind(to_json(&record.validation))
                .push_unseparated("::jsonb");
        });

        query_builder.push(
            " ON CONFLICT (business_date, payment_id) DO UPDATE SET
                order_number = EXCLUDED.order_number,
                check_number = EXCLUDED.check_number,
                subtotal = EXCLUDED.subtotal,
                tax = EXCLUDED.tax,
                tip = EXCLUDED.tip,
                gratuity = EXCLUDED.gratuity,
                discount = EXCLUDED.discount,
                total = EXCLUDED.total,
                table_label = EXCLUDED.table_label,
                guest_count = EXCLUDED.guest_count,
                revenue_center = EXCLUDED.revenue_center,
                server_name = EXCLUDED.server_name,
                time_opened = EXCLUDED.time_opened,
                time_closed = EXCLUDED.time_closed,
                turnover_minutes = EXCLUDED.turnover_minutes,
                line_items = EXCLUDED.line_items,
                payments = EXCLUDED.payments,
                discounts = EXCLUDED.discounts,
                capture_page = EXCLUDED.capture_page,
                capture_attempt = EXCLUDED.capture_attempt,
                capture_pass = EXCLUDED.capture_pass,
                reconciliation_status = EXCLUDED.reconciliation_status,
                validation_failed = EXCLUDED.validation_failed,
                validation = EXCLUDED.validation,
                updated_at = now()",
        );

        execute_with_timeout(pool, query_builder, "pos_check").await?;
    }
    Ok(())
}

/// 批量 upsert 订单对账行, 主键 (business_date, order_number)
pub async fn upsert_reconciliation(
    pool: &PgPool,
    rows: &[ReconciliationRow],
) -> Result<(), sqlx::Error> {
    if rows.is_empty() {
        return Ok(());
    }

    for chunk in rows.chunks(CHUNK_ROWS) {
        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO pos_order_reconciliation (
                business_date, order_number, captured_check_count,
                expected_check_count, reconciliation_status, amount_gap
            ) ",
        );

        query_builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.business_date)
                .push_bind(row.order_number)
                .push_bind(row.captured_check_count as i32)
                .push_bind(row.expected_check_count as i32)
                .push_bind(row.reconciliation_status.as_str())
                .push_bind(row.amount_gap.clone());
        });

        query_builder.push(
            " ON CONFLICT (business_date, order_number) DO UPDATE SET
                captured_check_count = EXCLUDED.captured_check_count,
                expected_check_count = EXCLUDED.expected_check_count,
                reconciliation_status = EXCLUDED.reconciliation_status,
                amount_gap = EXCLUDED.amount_gap,
                updated_at = now()",
        );

        execute_with_timeout(pool, query_builder, "pos_order_reconciliation").await?;
    }
    Ok(())
}

async fn execute_with_timeout(
    pool: &PgPool,
    mut query_builder: sqlx::QueryBuilder<'_, sqlx::Postgres>,
    table: &str,
) -> Result<(), sqlx::Error> {
    let execute_start = Instant::now();

    // 超时控制: 30秒
    let execute_result =
        tokio::time::timeout(EXECUTE_TIMEOUT, query_builder.build().execute(pool)).await;

    match execute_result {
        Ok(Ok(result)) => {
            tracing::info!(
                "✓ UPSERT {} 执行成功, 影响 {} 行, 耗时: {:?}",
                table,
                result.rows_affected(),
                execute_start.elapsed()
            );
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!(
                "✗ UPSERT {} 执行失败, 耗时: {:?}, 错误: {:?}",
                table,
                execute_start.elapsed(),
                e
            );
            Err(e)
        }
        Err(_) => {
            tracing::error!("✗ UPSERT {} 操作超时 (>30秒)!", table);
            Err(sqlx::Error::PoolTimedOut)
        }
    }
}

fn option_to_csv(val: &Option<BigDecimal>) -> String {
    val.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// 导出对账报告到 CSV (带表头, 每个订单一行)
pub fn export_report_csv(rows: &[ReconciliationRow], output_path: &Path) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(output_path)?;

    writer.write_record([
        "business_date",
        "order_number",
        "captured_check_count",
        "expected_check_count",
        "reconciliation_status",
        "amount_gap",
    ])?;

    for row in rows {
        writer.write_record(&[
            row.business_date.to_string(),
            row.order_number.to_string(),
            row.captured_check_count.to_string(),
            row.expected_check_count.to_string(),
            row.reconciliation_status.as_str().to_string(),
            option_to_csv(&row.amount_gap),
        ])?;
    }

    writer.flush()?;
    Ok(())
}
