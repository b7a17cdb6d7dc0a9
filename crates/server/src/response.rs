//! Error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use herald_common::AppError;
use serde_json::json;

/// Handler error rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl ApiError {
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Delivery(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Queue(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<E: Into<AppError>> From<E> for ApiError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.0.error_code();

        if status.is_server_error() {
            tracing::error!(error = %self.0, code, "Request failed");
        } else {
            tracing::debug!(error = %self.0, code, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
