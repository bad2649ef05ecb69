use super::AppState;
use crate::models::{DateReport, RunSummary};
use crate::service::dates_between;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 请求体: 营业日闭区间
#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// 响应体
#[derive(Debug, Serialize)]
pub struct CrawlResponse {
    pub success: bool,
    pub message: String,
    pub summary: Option<RunSummary>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub success: bool,
    pub message: String,
    pub report: Option<DateReport>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 爬取一个日期区间; 返回每个日期是干净、不完整还是失败
pub async fn crawl_range(State(state): State<AppState>, Json(req): Json<CrawlRequest>) -> Response {
    let dates = match dates_between(req.start_date, req.end_date) {
        Ok(dates) => dates,
        Err(e) => {
            let response = CrawlResponse {
                success: false,
                message: e.to_string(),
                summary: None,
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let summary = state.runner.run(dates, &state.cancel).await;
    let response = CrawlResponse {
        success: summary.all_clean(),
        message: format!(
            "Crawled {} dates: {} clean, {} incomplete, {} failed",
            summary.dates.len(),
            summary.count(crate::models::DateStatus::Clean),
            summary.count(crate::models::DateStatus::Incomplete),
            summary.count(crate::models::DateStatus::Failed),
        ),
        summary: Some(summary),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// 某营业日最近一次的报告
pub async fn get_report(State(state): State<AppState>, Path(date): Path<NaiveDate>) -> Response {
    match state.runner.report(date) {
        Some(report) => {
            let response = ReportResponse {
                success: true,
                message: format!("{} orders, {} checks", report.orders.len(), report.records.len()),
                report: Some(report),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        None => {
            let response = ReportResponse {
                success: false,
                message: format!("No report for {date}"),
                report: None,
            };
            (StatusCode::NOT_FOUND, Json(response)).into_response()
        }
    }
}
