use crate::algorithms::AlgorithmKind;
use crate::circuit_breaker::BreakerSnapshot;
use crate::metrics::MetricsSnapshot;
use crate::throttler::{Decision, FailMode};
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Body and headers of `POST /v1/check`.
#[derive(Debug)]
pub struct CheckLimitResponse(pub Decision);

impl CheckLimitResponse {
    fn headers(&self) -> HeaderMap {
        let decision = &self.0;
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
        headers.insert(
            "X-RateLimit-Reset",
            HeaderValue::from(decision.reset_at.ceil() as u64),
        );
        if !decision.allowed {
            // whole seconds, rounded up
            let retry_after_secs = decision.retry_after_ms.div_ceil(1000).max(1);
            headers.insert("Retry-After", HeaderValue::from(retry_after_secs));
        }
        headers
    }
}

impl IntoResponse for CheckLimitResponse {
    fn into_response(self) -> Response {
        let status = if self.0.allowed {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        };
        (status, self.headers(), Json(self.0)).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    pub client_id: String,
    pub rate: u32,
    pub window: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerStatus {
    #[serde(flatten)]
    pub breaker: BreakerSnapshot,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: std::time::Duration,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub algorithm: AlgorithmKind,
    pub fail_mode: FailMode,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}
