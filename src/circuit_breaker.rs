//! Circuit breaker guarding calls into the shared store.
//!
//! State is process-local. Replicas do not share it, so each instance decides
//! on its own when to fail fast; a store outage is detected independently by
//! every replica within `failure_threshold` calls.

use crate::clock::{Clock, SystemClock};
use crate::error::{BreakerError, ThrottlerError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without running.
    Open,
    /// Trial calls pass through; the next outcome decides.
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits after its last failure before a trial call.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), ThrottlerError> {
        if self.failure_threshold == 0 {
            return Err(ThrottlerError::ConfigurationError(
                "Breaker failure threshold must be greater than 0".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ThrottlerError::ConfigurationError(
                "Breaker success threshold must be greater than 0".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ThrottlerError::ConfigurationError(
                "Breaker recovery timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_ms: Option<u64>,
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(with = "humantime_serde")]
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_ms: None,
            }),
            clock,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` under breaker protection.
    ///
    /// When the breaker is open the future is dropped unpolled and
    /// [`BreakerError::Open`] carries the remaining wait. Otherwise the
    /// operation's own error is recorded and returned as [`BreakerError::Inner`].
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if let Err(retry_after) = self.admit() {
            return Err(BreakerError::Open { retry_after });
        }

        match operation.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now_millis();
        let inner = self.lock();
        let retry_after = match inner.state {
            CircuitState::Open => self.remaining_wait(&inner, now),
            _ => Duration::ZERO,
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_after,
        }
    }

    /// Force the breaker open as if a failure had just been recorded.
    pub fn trip(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.last_failure_ms = Some(now);
        warn!("Circuit breaker forced OPEN");
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_ms = None;
        info!("Circuit breaker reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remaining_wait(&self, inner: &BreakerState, now: u64) -> Duration {
        let elapsed = Duration::from_millis(now.saturating_sub(inner.last_failure_ms.unwrap_or(now)));
        self.config.recovery_timeout.saturating_sub(elapsed)
    }

    /// `Err(wait)` while open; moves OPEN to HALF_OPEN once the timeout has elapsed.
    fn admit(&self) -> Result<(), Duration> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let wait = self.remaining_wait(&inner, now);
        if !wait.is_zero() {
            return Err(wait);
        }

        inner.state = CircuitState::HalfOpen;
        inner.success_count = 0;
        info!("Circuit breaker entering HALF_OPEN state");
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.success_count = 0;
                info!("Circuit breaker CLOSED, store recovered");
            }
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_ms = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!("Circuit breaker trial call failed, back to OPEN");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    failures = inner.failure_count,
                    "Circuit breaker OPEN after consecutive failures"
                );
            }
            _ => {}
        }
    }
}
