use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the shared state store.
///
/// All variants are transient from the engine's point of view: they count
/// toward the circuit breaker and are resolved by the fail policy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[error("optimistic update of `{key}` lost {attempts} consecutive races")]
    Contention { key: String, attempts: u32 },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Outcome of a call routed through the circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit breaker is open, retry after {retry_after:?}")]
    Open { retry_after: Duration },

    /// The guarded operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

#[derive(Debug, Error)]
pub enum ThrottlerError {
    /// Enforcement is unavailable and the fail policy is fail-closed.
    #[error("rate limiter temporarily unavailable")]
    ServiceUnavailable,

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ThrottlerResult<T> = Result<T, ThrottlerError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_throttler_error(err: &ThrottlerError) -> Self {
        match err {
            ThrottlerError::ServiceUnavailable => Self::new(
                "service_unavailable",
                "Rate limiter temporarily unavailable",
                503,
            ),
            ThrottlerError::ValidationError(msg) => Self::new("validation_error", msg, 422),
            ThrottlerError::ConfigurationError(msg) => Self::new("configuration_error", msg, 500),
            ThrottlerError::Internal(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_throttler_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(body)).into_response();
        if matches!(self, ThrottlerError::ServiceUnavailable) {
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}
