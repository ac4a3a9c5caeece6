//! Token bucket rate limiting algorithm
//!
//! Capacity `rate` refills continuously at `rate / window` tokens per second.
//! The bucket lives in the shared store as one value, `"{tokens}|{last_refill_ms}"`,
//! and is updated with a compare-and-swap loop: read, compute locally, then
//! write back only if the value is still the one that was read.

use super::{ceil_ms, AlgorithmKind, AlgorithmOutcome, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::key_generator::LimitKey;
use crate::store::{Condition, Pipeline, Reply, SharedStore};
use async_trait::async_trait;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

const NAMESPACE: &str = "token_bucket";

/// Lost races tolerated before a check gives up with [`StoreError::Contention`].
pub const MAX_CAS_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl BucketState {
    pub fn full(rate: u32, now_ms: u64) -> Self {
        Self {
            tokens: f64::from(rate),
            last_refill_ms: now_ms,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}", self.tokens, self.last_refill_ms)
    }

    pub fn decode(raw: &str) -> StoreResult<Self> {
        let corrupt = || StoreError::Protocol(format!("corrupt bucket state `{}`", raw));
        let (tokens, last_refill) = raw.split_once('|').ok_or_else(corrupt)?;
        let tokens: f64 = tokens.parse().map_err(|_| corrupt())?;
        let last_refill_ms: u64 = last_refill.parse().map_err(|_| corrupt())?;
        if !tokens.is_finite() || tokens < 0.0 {
            return Err(corrupt());
        }
        Ok(Self {
            tokens,
            last_refill_ms,
        })
    }

    /// Add the tokens accrued since `last_refill_ms`, capped at `rate`.
    ///
    /// A clock behind `last_refill_ms` (another replica wrote last) accrues nothing.
    pub fn refill(self, rate: u32, window: u32, now_ms: u64) -> Self {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        // rate/window tokens per second, kept integral until the final division
        let accrued = (elapsed_ms as f64 * f64::from(rate)) / (f64::from(window) * 1000.0);
        Self {
            tokens: (self.tokens + accrued).min(f64::from(rate)),
            last_refill_ms: self.last_refill_ms.max(now_ms),
        }
    }

    /// Consume `cost` tokens if available. A denial leaves the tokens untouched.
    pub fn take(self, rate: u32, window: u32, cost: u32) -> (Self, AlgorithmOutcome) {
        let cost = f64::from(cost);
        if self.tokens >= cost {
            let next = Self {
                tokens: self.tokens - cost,
                ..self
            };
            debug_assert!(next.tokens >= 0.0 && next.tokens <= f64::from(rate));
            (next, AlgorithmOutcome::allowed(next.tokens.floor() as u64))
        } else {
            let missing = cost - self.tokens;
            let retry_after_ms = ceil_ms(missing * f64::from(window) * 1000.0 / f64::from(rate));
            (
                self,
                AlgorithmOutcome::denied(self.tokens.floor() as u64, retry_after_ms),
            )
        }
    }
}

pub struct TokenBucketLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLimiter {
    async fn check(
        &self,
        key: &LimitKey,
        rate: u32,
        window: u32,
        cost: NonZeroU32,
    ) -> StoreResult<AlgorithmOutcome> {
        let bucket_key = key.store_key(NAMESPACE);
        let ttl_secs = u64::from(window) * 2;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let current = self.store.get(&bucket_key).await?;
            let state = match current.as_deref() {
                Some(raw) => BucketState::decode(raw)?,
                None => BucketState::full(rate, now),
            };

            let (next, outcome) = state.refill(rate, window, now).take(rate, window, cost.get());

            let batch = Pipeline::new()
                .guard(Condition::ValueEquals {
                    key: bucket_key.clone(),
                    expected: current,
                })
                .set_with_ttl(&bucket_key, next.encode(), ttl_secs);
            let replies = self.store.execute(&batch).await?;

            if replies.first().map(Reply::passed).transpose()?.unwrap_or(false) {
                return Ok(outcome);
            }
            debug!(key = %bucket_key, attempt, "Bucket changed underneath us, retrying");
        }

        Err(StoreError::Contention {
            key: bucket_key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::TokenBucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn cost(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn limiter() -> (TokenBucketLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiter = TokenBucketLimiter::new(store.clone(), Arc::new(clock.clone()));
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_first_request_starts_full() {
        let (limiter, _, _) = limiter();
        let outcome = limiter
            .check(&LimitKey::global("client1"), 100, 60, cost(1))
            .await
            .unwrap();
        assert_eq!(outcome, AlgorithmOutcome::allowed(99));
    }

    #[tokio::test]
    async fn test_exhaustion_then_recovery() {
        let (limiter, _, clock) = limiter();
        let key = LimitKey::global("client1");

        let mut last_remaining = u64::MAX;
        for _ in 0..100 {
            let outcome = limiter.check(&key, 100, 60, cost(1)).await.unwrap();
            assert!(outcome.allowed);
            assert!(outcome.remaining < last_remaining);
            last_remaining = outcome.remaining;
        }
        assert_eq!(last_remaining, 0);

        let denied = limiter.check(&key, 100, 60, cost(1)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_ms, 600);

        clock.advance(Duration::from_millis(denied.retry_after_ms));
        let recovered = limiter.check(&key, 100, 60, cost(1)).await.unwrap();
        assert!(recovered.allowed);
    }

    #[tokio::test]
    async fn test_high_cost_denial_consumes_nothing() {
        let (limiter, store, _) = limiter();
        let key = LimitKey::global("client1");

        let first = limiter.check(&key, 100, 60, cost(10)).await.unwrap();
        assert_eq!(first, AlgorithmOutcome::allowed(90));
        let before = store.get(&key.store_key(NAMESPACE)).await.unwrap();

        let denied = limiter.check(&key, 100, 60, cost(95)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 90);
        assert_eq!(denied.retry_after_ms, 3_000);
        assert_eq!(store.get(&key.store_key(NAMESPACE)).await.unwrap(), before);

        let again = limiter.check(&key, 100, 60, cost(90)).await.unwrap();
        assert_eq!(again, AlgorithmOutcome::allowed(0));
    }

    #[tokio::test]
    async fn test_clients_and_endpoints_isolated() {
        let (limiter, _, _) = limiter();
        for _ in 0..50 {
            limiter.check(&LimitKey::global("client1"), 100, 60, cost(1)).await.unwrap();
            limiter.check(&LimitKey::new("client1", "login"), 100, 60, cost(1)).await.unwrap();
        }

        let other_client = limiter.check(&LimitKey::global("client2"), 100, 60, cost(1)).await.unwrap();
        assert_eq!(other_client.remaining, 99);
        let other_key = limiter.check(&LimitKey::new("client1", "search"), 100, 60, cost(1)).await.unwrap();
        assert_eq!(other_key.remaining, 99);
        let own = limiter.check(&LimitKey::global("client1"), 100, 60, cost(1)).await.unwrap();
        assert_eq!(own.remaining, 49);
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_rate() {
        let (limiter, _, clock) = limiter();
        let key = LimitKey::global("client1");
        limiter.check(&key, 10, 10, cost(5)).await.unwrap();

        clock.advance(Duration::from_secs(3_600));
        let outcome = limiter.check(&key, 10, 10, cost(1)).await.unwrap();
        assert_eq!(outcome.remaining, 9);
    }

    #[tokio::test]
    async fn test_bucket_expires_after_twice_the_window() {
        let (limiter, store, clock) = limiter();
        let key = LimitKey::global("idle");
        limiter.check(&key, 10, 30, cost(1)).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert!(store.get(&key.store_key(NAMESPACE)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_protocol_error() {
        let (limiter, store, _) = limiter();
        let key = LimitKey::global("client1");
        store.set_with_ttl(&key.store_key(NAMESPACE), "garbage", 60).await.unwrap();

        let result = limiter.check(&key, 10, 10, cost(1)).await;
        assert!(matches!(result, Err(StoreError::Protocol(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_over_admit() {
        let (limiter, _, _) = limiter();
        let limiter = Arc::new(limiter);
        let key = LimitKey::global("hot");

        let handles: Vec<_> = (0..120)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.check(&key, 100, 60, cost(1)).await })
            })
            .collect();

        let (mut allowed, mut denied, mut contended) = (0, 0, 0);
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) if outcome.allowed => allowed += 1,
                Ok(_) => denied += 1,
                Err(StoreError::Contention { .. }) => contended += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert!(allowed <= 100);
        assert_eq!(allowed + denied + contended, 120);
        if contended == 0 {
            assert_eq!(allowed, 100);
        }
    }

    #[test]
    fn test_state_encoding_is_exact() {
        let state = BucketState {
            tokens: 41.666666666666664,
            last_refill_ms: 1_700_000_000_123,
        };
        assert_eq!(BucketState::decode(&state.encode()).unwrap(), state);
        assert!(BucketState::decode("12").is_err());
        assert!(BucketState::decode("-1|5").is_err());
    }

    #[test]
    fn test_clock_skew_accrues_nothing() {
        let state = BucketState {
            tokens: 3.0,
            last_refill_ms: 10_000,
        };
        let refilled = state.refill(10, 10, 9_000);
        assert_eq!(refilled.tokens, 3.0);
        assert_eq!(refilled.last_refill_ms, 10_000);
    }
}
