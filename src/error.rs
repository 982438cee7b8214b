// =============================================================================
// Error taxonomy — typed kinds at the seams, anyhow everywhere else
// =============================================================================
//
// Most of the engine propagates `anyhow::Result` with `.context(...)`, the
// same as the rest of this codebase. The seams that actually branch on
// *kind* (the risk gate, the HTTP boundary) use `EngineError` instead so
// the caller can match rather than string-sniff.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("risk rejected: {0}")]
    RiskReject(String),

    #[error("strategy already running: {0}")]
    AlreadyRunning(String),

    #[error("engine not ready")]
    EngineNotReady,

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RiskReject(_) => StatusCode::CONFLICT,
            Self::AlreadyRunning(_) => StatusCode::CONFLICT,
            Self::EngineNotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transient(_) => StatusCode::BAD_GATEWAY,
            Self::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Capacity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec_table() {
        assert_eq!(
            EngineError::Invalid("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::RiskReject("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::AlreadyRunning("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(EngineError::EngineNotReady.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            EngineError::Transient("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            EngineError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
