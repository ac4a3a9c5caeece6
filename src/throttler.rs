use crate::algorithms::{AlgorithmKind, AlgorithmOutcome, RateLimitAlgorithm};
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::error::{BreakerError, StoreError, ThrottlerError, ThrottlerResult};
use crate::key_generator::LimitKey;
use crate::metrics::MetricsCollector;
use crate::rate_limit_config::{RateLimitRule, RuleBook};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// What to do when the shared store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Admit the request without consuming budget.
    #[default]
    Open,
    /// Reject with a service-unavailable condition.
    Closed,
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailMode::Open => f.write_str("open"),
            FailMode::Closed => f.write_str("closed"),
        }
    }
}

impl FromStr for FailMode {
    type Err = ThrottlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(ThrottlerError::ConfigurationError(format!(
                "Unknown fail mode '{}'. Must be 'open' or 'closed'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlerSettings {
    pub fail_mode: FailMode,
    /// Upper bound on one algorithm round trip to the store.
    pub store_timeout: Duration,
}

impl Default for ThrottlerSettings {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Open,
            store_timeout: Duration::from_millis(100),
        }
    }
}

/// Normalized outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u32,
    pub window: u32,
    pub retry_after_ms: u64,
    /// Epoch seconds.
    pub reset_at: f64,
}

impl Decision {
    fn from_outcome(outcome: AlgorithmOutcome, rule: RateLimitRule, now_secs: f64) -> Self {
        Self {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            limit: rule.rate,
            window: rule.window,
            retry_after_ms: outcome.retry_after_ms,
            reset_at: now_secs + f64::from(rule.window),
        }
    }

    /// Decision granted without consulting the store.
    fn fail_open(rule: RateLimitRule, now_secs: f64) -> Self {
        Self::from_outcome(AlgorithmOutcome::allowed(u64::from(rule.rate)), rule, now_secs)
    }
}

/// Decision engine: rule resolution, algorithm invocation through the
/// circuit breaker, and the fail policy.
pub struct Throttler {
    rules: RuleBook,
    algorithm: Arc<dyn RateLimitAlgorithm>,
    breaker: Arc<CircuitBreaker>,
    settings: ThrottlerSettings,
    metrics: MetricsCollector,
    clock: Arc<dyn Clock>,
}

impl Throttler {
    pub fn new(
        rules: RuleBook,
        algorithm: Arc<dyn RateLimitAlgorithm>,
        breaker: Arc<CircuitBreaker>,
        settings: ThrottlerSettings,
        metrics: MetricsCollector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules,
            algorithm,
            breaker,
            settings,
            metrics,
            clock,
        }
    }

    /// Decide whether `cost` units for `(client_id, limit_key)` may proceed.
    ///
    /// Store and breaker failures never escape as their own errors: under
    /// fail-open they become an allowed decision, under fail-closed a
    /// [`ThrottlerError::ServiceUnavailable`].
    pub async fn check(
        &self,
        client_id: &str,
        limit_key: &str,
        cost: NonZeroU32,
    ) -> ThrottlerResult<Decision> {
        let started = Instant::now();
        let rule = self.rules.resolve(client_id, limit_key);
        let key = LimitKey::new(client_id, limit_key);
        let timeout = self.settings.store_timeout;

        let result = self
            .breaker
            .call(async {
                tokio::time::timeout(timeout, self.algorithm.check(&key, rule.rate, rule.window, cost))
                    .await
                    .unwrap_or(Err(StoreError::Timeout(timeout)))
            })
            .await;

        let decision = match result {
            Ok(outcome) => {
                if outcome.allowed {
                    self.metrics.record_allowed(client_id, limit_key);
                } else {
                    self.metrics.record_blocked(client_id, limit_key);
                }
                debug!(
                    %key,
                    allowed = outcome.allowed,
                    remaining = outcome.remaining,
                    retry_after_ms = outcome.retry_after_ms,
                    "Rate limit checked"
                );
                Ok(Decision::from_outcome(outcome, rule, self.clock.now_secs()))
            }
            Err(BreakerError::Open { retry_after }) => {
                warn!(%key, ?retry_after, "Circuit breaker open, store not consulted");
                self.metrics.record_error("breaker_open");
                self.degrade(rule)
            }
            Err(BreakerError::Inner(err)) => {
                error!(%key, error = %err, "Rate limit check failed");
                self.metrics.record_error("store_error");
                self.degrade(rule)
            }
        };

        self.metrics.record_latency(started.elapsed());
        decision
    }

    fn degrade(&self, rule: RateLimitRule) -> ThrottlerResult<Decision> {
        match self.settings.fail_mode {
            FailMode::Open => Ok(Decision::fail_open(rule, self.clock.now_secs())),
            FailMode::Closed => Err(ThrottlerError::ServiceUnavailable),
        }
    }

    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn settings(&self) -> ThrottlerSettings {
        self.settings
    }

    pub fn algorithm_kind(&self) -> AlgorithmKind {
        self.algorithm.kind()
    }
}
