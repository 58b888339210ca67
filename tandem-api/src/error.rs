//! Error Types for tandem API
//!
//! This module defines error handling for the HTTP layer:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation producing the `fail` envelope
//!
//! Service and repository errors are mapped onto codes here, so handlers
//! can use `?` directly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_core::{ConfigError, PoolError, RepoError};

use crate::services::ServiceError;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    /// The `x-request-id` header is not a UUID
    InvalidRequestId,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// No live record for the key in either store
    KeyNotFound,

    /// No route matches the request path
    RouteNotFound,

    // ========================================================================
    // Server Errors (500, 503, 504)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// A backing store failed
    BackendError,

    /// The etcd client pool has been shut down
    ServiceUnavailable,

    /// No etcd client became available in time
    ConnectionPoolExhausted,

    /// The request deadline passed
    Timeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput | ErrorCode::MissingField | ErrorCode::InvalidRequestId => {
                StatusCode::BAD_REQUEST
            }

            ErrorCode::KeyNotFound | ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,

            ErrorCode::ServiceUnavailable | ErrorCode::ConnectionPoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::InternalError | ErrorCode::BackendError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidRequestId => "Invalid Request-Id",
            ErrorCode::KeyNotFound => "Key not found",
            ErrorCode::RouteNotFound => "Route not found",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::BackendError => "Backend operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::ConnectionPoolExhausted => "Connection pool exhausted",
            ErrorCode::Timeout => "Operation timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response.
///
/// Serialized inside the `fail` envelope, next to the request id when one
/// is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Tag the error with the request it belongs to.
    pub fn with_request_id(mut self, request_id: impl fmt::Display) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_request_id() -> Self {
        Self::from_code(ErrorCode::InvalidRequestId)
    }

    pub fn key_not_found(key: &str) -> Self {
        Self::new(ErrorCode::KeyNotFound, format!("Key '{}' not found", key))
    }

    pub fn route_not_found(path: &str) -> Self {
        Self::new(
            ErrorCode::RouteNotFound,
            format!("Path: {} does not exist on this server", path),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn backend_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

#[derive(Serialize)]
struct FailEnvelope<'a> {
    status: &'static str,
    #[serde(flatten)]
    error: &'a ApiError,
}

/// Renders `{"status":"fail","code":..,"message":..,"request_id":..}`.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, request_id = ?self.request_id, "Request failed");
        }
        let body = Json(FailEnvelope {
            status: "fail",
            error: &self,
        });
        (status, body).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn code_for(err: &RepoError) -> ErrorCode {
    match err {
        RepoError::Pool(PoolError::Closed) => ErrorCode::ServiceUnavailable,
        RepoError::Pool(PoolError::Timeout { .. }) | RepoError::Pool(PoolError::Exhausted { .. }) => {
            ErrorCode::ConnectionPoolExhausted
        }
        RepoError::Scan { .. } | RepoError::UnknownAction { .. } => ErrorCode::InternalError,
        _ => ErrorCode::BackendError,
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        ApiError::new(code_for(&err), err.to_string())
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::NotFound { key } => ApiError::key_not_found(key),
            ServiceError::Read { etcd, postgres } => {
                let (etcd_code, postgres_code) = (code_for(etcd), code_for(postgres));
                let code = if etcd_code == postgres_code {
                    etcd_code
                } else {
                    ErrorCode::BackendError
                };
                ApiError::new(code, err.to_string()).with_details(serde_json::json!({
                    "etcd": etcd.to_string(),
                    "postgres": postgres.to_string(),
                }))
            }
            ServiceError::Write { source } => ApiError::new(code_for(source), err.to_string()),
            ServiceError::Timeout(_) => ApiError::timeout(err.to_string()),
            ServiceError::Cancelled | ServiceError::Encode(_) => ApiError::internal_error(err.to_string()),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::invalid_input(err.to_string())
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tandem_core::Backend;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::InvalidInput.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::InvalidRequestId.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::KeyNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::BackendError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::ServiceUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_service_error_mapping() {
        let not_found: ApiError = ServiceError::NotFound { key: "k".into() }.into();
        assert_eq!(not_found.code, ErrorCode::KeyNotFound);

        let closed: ApiError = ServiceError::Write {
            source: RepoError::Pool(PoolError::Closed),
        }
        .into();
        assert_eq!(closed.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout: ApiError = ServiceError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let read: ApiError = ServiceError::Read {
            etcd: RepoError::Pool(PoolError::Closed),
            postgres: RepoError::backend_failure(Backend::Postgres, "boom"),
        }
        .into();
        assert_eq!(read.code, ErrorCode::BackendError);
        assert!(read.details.is_some());
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::key_not_found("k1").with_request_id("abc");
        let json = serde_json::to_string(&err)?;
        assert!(json.contains("KEY_NOT_FOUND"));
        assert!(json.contains("\"request_id\":\"abc\""));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }

    #[test]
    fn test_fail_envelope_shape() {
        let err = ApiError::invalid_request_id();
        let value = serde_json::to_value(FailEnvelope {
            status: "fail",
            error: &err,
        })
        .unwrap();
        assert_eq!(value["status"], "fail");
        assert_eq!(value["message"], "Invalid Request-Id");
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::backend_error("connection refused");
        let display = format!("{}", err);
        assert!(display.contains("BackendError"));
        assert!(display.contains("connection refused"));
    }
}
