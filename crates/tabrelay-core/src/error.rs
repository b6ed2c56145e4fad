//! Error types for the bridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No worker connected: {0}")]
    WorkerUnavailable(String),

    #[error("Upstream challenge page detected: {0}")]
    UpstreamChallenge(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Stream timed out after {0}s without data")]
    DecodeTimeout(u64),

    #[error("Session {session_id} does not own task {task_id}")]
    SessionInconsistency { session_id: String, task_id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::WorkerUnavailable(_) | Error::UpstreamChallenge(_) => 503,
            Error::UpstreamError(_) => 502,
            Error::DecodeTimeout(_) => 504,
            Error::Unauthorized(_) => 401,
            Error::InvalidRequest(_) => 400,
            Error::NotFound(_) => 404,
            Error::SessionInconsistency { .. } => 409,
            Error::Io(_) | Error::Json(_) | Error::Config(_) | Error::Internal(_) => 500,
        }
    }

    /// Short machine-readable kind, used as the `type` of error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::WorkerUnavailable(_) => "worker_unavailable",
            Error::UpstreamChallenge(_) => "upstream_challenge",
            Error::UpstreamError(_) => "upstream_error",
            Error::DecodeTimeout(_) => "timeout",
            Error::SessionInconsistency { .. } => "session_inconsistency",
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Io(_) | Error::Json(_) | Error::Config(_) | Error::Internal(_) => "bridge_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::WorkerUnavailable("none".into()).status_code(), 503);
        assert_eq!(Error::UpstreamError("boom".into()).status_code(), 502);
        assert_eq!(Error::DecodeTimeout(60).status_code(), 504);
        assert_eq!(Error::Unauthorized("key".into()).status_code(), 401);
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::DecodeTimeout(60);
        assert_eq!(err.to_string(), "Stream timed out after 60s without data");
        assert_eq!(err.kind(), "timeout");
    }
}
