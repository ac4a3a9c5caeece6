//! Fixed window rate limiting algorithm
//!
//! Counts cost per discrete window `[start, start + window)`. Up to `2 × rate`
//! can pass in a span straddling two adjacent windows; that burst is inherent
//! to the algorithm.

use super::{AlgorithmKind, AlgorithmOutcome, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::key_generator::LimitKey;
use crate::store::{Pipeline, SharedStore};
use async_trait::async_trait;
use std::num::NonZeroU32;
use std::sync::Arc;

const NAMESPACE: &str = "fixed_window";

pub struct FixedWindowLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Epoch second at which the window containing `now_ms` began.
    pub fn window_start(now_ms: u64, window: u32) -> u64 {
        let window_ms = u64::from(window) * 1000;
        (now_ms / window_ms) * window_ms / 1000
    }

    fn counter_key(key: &LimitKey, window_start: u64) -> String {
        format!("{}:{}", key.store_key(NAMESPACE), window_start)
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLimiter {
    async fn check(
        &self,
        key: &LimitKey,
        rate: u32,
        window: u32,
        cost: NonZeroU32,
    ) -> StoreResult<AlgorithmOutcome> {
        let now = self.clock.now_millis();
        let counter_key = Self::counter_key(key, Self::window_start(now, window));

        let batch =
            Pipeline::new().increment_with_ttl(&counter_key, i64::from(cost.get()), u64::from(window) + 1);
        let count = self
            .store
            .execute(&batch)
            .await?
            .first()
            .ok_or_else(|| StoreError::Protocol("no reply to window increment".into()))?
            .as_int()?
            .max(0) as u64;

        let rate = u64::from(rate);
        let remaining = rate.saturating_sub(count);
        if count <= rate {
            Ok(AlgorithmOutcome::allowed(remaining))
        } else {
            let window_ms = u64::from(window) * 1000;
            Ok(AlgorithmOutcome::denied(remaining, window_ms - now % window_ms))
        }
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::FixedWindow
    }
}
