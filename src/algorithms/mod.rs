//! Rate limiting algorithms module
//!
//! Three interchangeable strategies behind one capability. Each variant owns
//! its store key namespace and the exact batch it sends to the shared store;
//! none of them keeps state in the process.

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use crate::clock::Clock;
use crate::error::{StoreResult, ThrottlerError};
use crate::key_generator::LimitKey;
use crate::store::SharedStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;

/// Configured algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

impl AlgorithmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmKind::TokenBucket => "token_bucket",
            AlgorithmKind::FixedWindow => "fixed_window",
            AlgorithmKind::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = ThrottlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token_bucket" => Ok(AlgorithmKind::TokenBucket),
            "fixed_window" => Ok(AlgorithmKind::FixedWindow),
            "sliding_window" => Ok(AlgorithmKind::SlidingWindow),
            other => Err(ThrottlerError::ConfigurationError(format!(
                "Unknown algorithm '{}'. Must be one of: token_bucket, fixed_window, sliding_window",
                other
            ))),
        }
    }
}

/// Result of one algorithm check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
}

impl AlgorithmOutcome {
    pub fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: 0,
        }
    }

    pub fn denied(remaining: u64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after_ms,
        }
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Atomically consult and update the budget of `key`.
    ///
    /// `rate` units are available per `window` seconds; the request consumes
    /// `cost` of them when admitted.
    async fn check(
        &self,
        key: &LimitKey,
        rate: u32,
        window: u32,
        cost: NonZeroU32,
    ) -> StoreResult<AlgorithmOutcome>;

    fn kind(&self) -> AlgorithmKind;
}

/// Bind the configured algorithm to a store. Called once at startup.
pub fn build(
    kind: AlgorithmKind,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn RateLimitAlgorithm> {
    match kind {
        AlgorithmKind::TokenBucket => Arc::new(TokenBucketLimiter::new(store, clock)),
        AlgorithmKind::FixedWindow => Arc::new(FixedWindowLimiter::new(store, clock)),
        AlgorithmKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new(store, clock)),
    }
}

/// Round a non-negative millisecond quantity up to a whole millisecond.
pub(crate) fn ceil_ms(ms: f64) -> u64 {
    if ms <= 0.0 {
        0
    } else {
        ms.ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    #[test]
    fn test_algorithm_kind_parsing() {
        assert_eq!("token_bucket".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::TokenBucket);
        assert_eq!(" Fixed_Window ".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::FixedWindow);
        assert_eq!("sliding_window".parse::<AlgorithmKind>().unwrap(), AlgorithmKind::SlidingWindow);
        assert!(matches!(
            "leaky_bucket".parse::<AlgorithmKind>(),
            Err(ThrottlerError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_algorithm_kind_serde() {
        let json = serde_json::to_string(&AlgorithmKind::SlidingWindow).unwrap();
        assert_eq!(json, "\"sliding_window\"");
    }

    #[test]
    fn test_build_binds_requested_kind() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new(clock.clone()));
        for kind in [
            AlgorithmKind::TokenBucket,
            AlgorithmKind::FixedWindow,
            AlgorithmKind::SlidingWindow,
        ] {
            assert_eq!(build(kind, store.clone(), clock.clone()).kind(), kind);
        }
    }

    #[test]
    fn test_ceil_ms() {
        assert_eq!(ceil_ms(-3.0), 0);
        assert_eq!(ceil_ms(0.0), 0);
        assert_eq!(ceil_ms(599.0001), 600);
        assert_eq!(ceil_ms(600.0), 600);
    }
}
