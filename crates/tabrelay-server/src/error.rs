//! HTTP mapping for bridge errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use tabrelay_chat::ErrorBody;
use tabrelay_core::Error;

/// Bridge error rendered as an OpenAI-style error body.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(kind = self.0.kind(), "Request failed: {}", self.0);
        }
        (status, Json(ErrorBody::new(self.0.to_string(), self.0.kind()))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
