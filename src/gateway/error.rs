//! JSON error responses for the HTTP handlers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

/// An error response: status plus `{"error": code, "detail"?: ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    detail: Option<String>,
}

impl ApiError {
    /// Error with status and machine-readable code.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str) -> Self {
        Self {
            status,
            code,
            detail: None,
        }
    }

    /// 400 with `code`.
    #[must_use]
    pub fn bad_request(code: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code)
    }

    /// 500 with `code`. The underlying error is logged, never returned.
    #[must_use]
    pub fn internal(code: &'static str, err: impl std::fmt::Display) -> Self {
        error!(code, error = %err, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code)
    }

    /// Attach a human-readable detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl std::fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    /// Response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.detail {
            Some(detail) => json!({ "error": self.code, "detail": detail }),
            None => json!({ "error": self.code }),
        };
        (self.status, Json(body)).into_response()
    }
}
