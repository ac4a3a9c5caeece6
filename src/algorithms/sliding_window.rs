//! Sliding window rate limiting algorithm
//!
//! Keeps a log of admitted units in a sorted set scored by epoch milliseconds.
//! A request of cost `c` is logged as `c` separate members, so the set size is
//! bounded by `rate` per key. Members are `"{now_ms}:{uuid}:{n}"`: unique across
//! replicas even when scores collide.
//!
//! A cost above `rate` can never fit in the window and is denied without a
//! store round trip.

use super::{ceil_ms, AlgorithmKind, AlgorithmOutcome, RateLimitAlgorithm};
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::key_generator::LimitKey;
use crate::store::{Condition, Pipeline, Reply, ScoreBound, SharedStore};
use async_trait::async_trait;
use std::num::NonZeroU32;
use std::sync::Arc;
use uuid::Uuid;

const NAMESPACE: &str = "sliding_window";

// Reply positions in the batch built by `check`.
const COUNT: usize = 1;
const OLDEST: usize = 2;
const GUARD: usize = 3;

pub struct SlidingWindowLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    async fn check(
        &self,
        key: &LimitKey,
        rate: u32,
        window: u32,
        cost: NonZeroU32,
    ) -> StoreResult<AlgorithmOutcome> {
        let window_ms = u64::from(window) * 1000;
        let cost = cost.get();
        if cost > rate {
            return Ok(AlgorithmOutcome::denied(0, window_ms));
        }

        let now = self.clock.now_millis();
        let log_key = key.store_key(NAMESPACE);
        let now_score = now as f64;
        let window_start = now.saturating_sub(window_ms) as f64;

        let batch = Pipeline::new()
            .prune_sorted_set(&log_key, ScoreBound::NegInf, ScoreBound::Exclusive(window_start))
            .count_sorted_set(
                &log_key,
                ScoreBound::Inclusive(window_start),
                ScoreBound::Inclusive(now_score),
            )
            .range_sorted_set(&log_key, 0, 0)
            .guard(Condition::CountAtMost {
                key: log_key.clone(),
                min: ScoreBound::Inclusive(window_start),
                max: ScoreBound::Inclusive(now_score),
                limit: i64::from(rate) - i64::from(cost),
            })
            .insert_sorted_set_many(&log_key, format!("{}:{}", now, Uuid::new_v4()), cost, now_score)
            .expire(&log_key, u64::from(window) + 1);

        let mut replies = self.store.execute(&batch).await?;
        if replies.len() != batch.len() {
            return Err(StoreError::Protocol(format!(
                "expected {} replies, got {}",
                batch.len(),
                replies.len()
            )));
        }

        let count = replies[COUNT].as_int()?.max(0) as u64;
        let rate = u64::from(rate);

        if replies[GUARD].passed()? {
            let remaining = rate.saturating_sub(count + u64::from(cost));
            return Ok(AlgorithmOutcome::allowed(remaining));
        }

        let oldest = std::mem::replace(&mut replies[OLDEST], Reply::Skipped).into_members()?;
        let retry_after_ms = match oldest.first() {
            Some((_, oldest_score)) => ceil_ms(oldest_score + window_ms as f64 - now_score),
            None => ceil_ms(window_ms as f64 / rate as f64),
        };

        Ok(AlgorithmOutcome::denied(rate.saturating_sub(count), retry_after_ms))
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::SlidingWindow
    }
}
