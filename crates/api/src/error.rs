//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use tunnelbot_shared::EngineError;

pub type ApiResult<T> = Result<T, ApiError>;

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            // The caller can retry; the upstream panel or network is down.
            EngineError::Transient(_) => StatusCode::BAD_GATEWAY,
            EngineError::Permanent(_)
            | EngineError::ConsistencyViolation(_)
            | EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        // Internal detail stays out of 5xx bodies.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
