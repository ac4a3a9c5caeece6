use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;
use tracing::info;

use crate::error::ThrottlerError;
use crate::health::HealthChecker;
use crate::rate_limit_config::RateLimitRule;
use crate::response::{CheckLimitResponse, CircuitBreakerStatus, MetricsResponse, RuleInfo};
use crate::throttler::Throttler;
use crate::validation::{CheckLimitRequest, RequestValidator, UpdateRuleRequest};

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub throttler: Throttler,
    pub health: HealthChecker,
}

/// Check whether a unit of work may proceed.
pub async fn check_limit(
    State(state): State<SharedState>,
    Json(request): Json<CheckLimitRequest>,
) -> Result<CheckLimitResponse, ThrottlerError> {
    RequestValidator::validate(&request)?;

    let decision = state
        .throttler
        .check(&request.client_id, &request.limit_key, request.cost()?)
        .await?;

    Ok(CheckLimitResponse(decision))
}

/// Upsert a client-level or endpoint rule.
pub async fn update_rule(
    State(state): State<SharedState>,
    Json(request): Json<UpdateRuleRequest>,
) -> Result<Json<RuleInfo>, ThrottlerError> {
    RequestValidator::validate(&request)?;

    let rule = RateLimitRule::new(request.rate, request.window);
    let rules = state.throttler.rules();
    match &request.endpoint {
        Some(endpoint) => rules.upsert_endpoint(&request.client_id, endpoint, rule),
        None => rules.upsert_client(&request.client_id, rule),
    }
    .map_err(|e| ThrottlerError::ValidationError(e.to_string()))?;

    info!(client_id = %request.client_id, endpoint = ?request.endpoint, "Rule updated via admin API");

    Ok(Json(RuleInfo {
        client_id: request.client_id,
        rate: request.rate,
        window: request.window,
        endpoint: request.endpoint,
    }))
}

pub async fn get_rules(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.throttler.rules().snapshot().as_ref().clone())
}

pub async fn circuit_breaker_status(State(state): State<SharedState>) -> impl IntoResponse {
    let breaker = state.throttler.breaker();
    Json(CircuitBreakerStatus {
        breaker: breaker.snapshot(),
        failure_threshold: breaker.config().failure_threshold,
        recovery_timeout: breaker.config().recovery_timeout,
    })
}

pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(MetricsResponse {
        algorithm: state.throttler.algorithm_kind(),
        fail_mode: state.throttler.settings().fail_mode,
        metrics: state.throttler.metrics().snapshot(),
    })
}

pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}
