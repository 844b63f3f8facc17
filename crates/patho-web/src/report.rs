//! 诊断报告下载

use crate::error::ApiResult;
use crate::extract::ApiQuery;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use patho_core::PathoError;
use std::collections::HashMap;

/// `GET /pathology/generatedoc?diagnosis__id=<id>`
pub async fn generate_document(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<HashMap<String, String>>,
) -> ApiResult<Response> {
    let raw = params
        .get("diagnosis__id")
        .ok_or_else(|| PathoError::invalid("diagnosis__id", "is required"))?;
    let diagnosis_id: i64 = raw
        .trim()
        .parse()
        .map_err(|_| PathoError::invalid("diagnosis__id", "must be an integer"))?;

    let report = state.reports.generate(diagnosis_id).await?;
    let disposition = HeaderValue::from_str(&report.content_disposition())
        .map_err(|e| PathoError::Internal(format!("invalid content disposition: {}", e)))?;

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static(report.content_type())),
        (header::CONTENT_DISPOSITION, disposition),
        (header::CONTENT_LENGTH, HeaderValue::from(report.content_length())),
    ];
    Ok((headers, report.bytes).into_response())
}
