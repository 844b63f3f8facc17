//! 错误到 HTTP 响应的映射

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use patho_core::PathoError;
use serde_json::json;

/// 接口错误，包装领域错误
#[derive(Debug)]
pub struct ApiError(pub PathoError);

impl From<PathoError> for ApiError {
    fn from(error: PathoError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PathoError::NotFound(_) => StatusCode::NOT_FOUND,
            PathoError::ReferentialIntegrity(_) | PathoError::Conflict(_) => StatusCode::CONFLICT,
            PathoError::Validation(_) => StatusCode::BAD_REQUEST,
            PathoError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected with {}: {}", status, self.0);
        }

        let mut body = json!({
            "error": true,
            "message": self.0.to_string(),
            "status": status.as_u16()
        });
        if let PathoError::Validation(errors) = &self.0 {
            body["fields"] = json!(errors.fields);
        }

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
