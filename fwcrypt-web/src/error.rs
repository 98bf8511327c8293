//! API error responses.
//!
//! Every failure is returned as `{"error": {"code", "category", "message"}}`. Engine
//! errors keep their stable code and category; internal faults are reduced to a generic
//! message before they leave the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fwcrypt_core::{AnalysisError, ErrorCategory};

/// Category of authentication and authorization failures.
pub const AUTH_CATEGORY: &str = "AuthError";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub category: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, category: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            category,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", AUTH_CATEGORY, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "Forbidden", AUTH_CATEGORY, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NotFound",
            ErrorCategory::InputError.as_str(),
            message,
        )
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, ErrorCategory::InputError.as_str(), message)
    }
}

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        let status: StatusCode = match &err {
            AnalysisError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AnalysisError::EmptyInput => StatusCode::BAD_REQUEST,
            AnalysisError::Truncated { .. }
            | AnalysisError::UnsupportedFormat(_)
            | AnalysisError::UnknownArchitecture { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AnalysisError::PoolSaturated { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AnalysisError::AnalysisTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AnalysisError::Cancelled => StatusCode::CONFLICT,
            AnalysisError::Internal(detail) => {
                log::error!("Internal fault: {}", detail);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.category().as_str(), err.public_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code,
                "category": self.category,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_fault_is_generic() {
        let err = ApiError::from(AnalysisError::internal("worker panicked at src/lib.rs:12"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "InternalFault");
        assert!(!err.message.contains("panicked"));
    }

    #[test]
    fn test_status_mapping() {
        let saturated = ApiError::from(AnalysisError::PoolSaturated { capacity: 4 });
        assert_eq!(saturated.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(saturated.category, "ResourceExhaustion");

        let unknown = ApiError::from(AnalysisError::UnknownArchitecture { confidence: 0.1 });
        assert_eq!(unknown.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(unknown.category, "InputError");

        let large = ApiError::from(AnalysisError::PayloadTooLarge { size: 10, limit: 4 });
        assert_eq!(large.status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
