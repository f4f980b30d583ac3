//! Application error type mapping to HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use parley_types::error::PoolError;

#[derive(Debug)]
pub enum AppError {
    /// A request is already in flight.
    Busy,
    Validation(String),
    Pool(PoolError),
    Internal(String),
}

impl From<PoolError> for AppError {
    fn from(e: PoolError) -> Self {
        AppError::Pool(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Busy => (
                StatusCode::CONFLICT,
                "REQUEST_IN_FLIGHT",
                "A request is already being processed".to_string(),
            ),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Pool(PoolError::Closed) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SHUTTING_DOWN",
                PoolError::Closed.to_string(),
            ),
            AppError::Pool(e) => (StatusCode::INTERNAL_SERVER_ERROR, "POOL_ERROR", e.to_string()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
