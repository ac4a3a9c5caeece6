use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyMetrics {
    pub checks: u64,
    pub mean_us: f64,
    pub max_us: u64,
}

/// Everything the `/metrics` endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: ThrottleMetrics,
    /// Keyed by `client/limit_key`.
    pub limits: BTreeMap<String, ThrottleMetrics>,
    /// Keyed by reason, e.g. `breaker_open` or `store_error`.
    pub errors: BTreeMap<String, u64>,
    pub latency: LatencyMetrics,
}

#[derive(Debug, Default)]
struct LimitCounters {
    allowed: AtomicU64,
    throttled: AtomicU64,
}

impl LimitCounters {
    fn load(&self) -> ThrottleMetrics {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let throttled = self.throttled.load(Ordering::Relaxed);
        ThrottleMetrics {
            total_requests: allowed + throttled,
            allowed_requests: allowed,
            throttled_requests: throttled,
        }
    }
}

#[derive(Debug, Default)]
struct Latency {
    total_us: AtomicU64,
    count: AtomicU64,
    max_us: AtomicU64,
}

#[derive(Debug, Default)]
struct Registry {
    limits: DashMap<String, LimitCounters>,
    errors: DashMap<String, AtomicU64>,
    latency: Latency,
}

/// In-process counters for allowed, blocked and failed checks.
///
/// Recording touches only the counters of one `client/limit_key` entry, so
/// checks on different keys never wait on each other.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allowed(&self, client_id: &str, limit_key: &str) {
        self.with_limit(client_id, limit_key, |c| {
            c.allowed.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_blocked(&self, client_id: &str, limit_key: &str) {
        self.with_limit(client_id, limit_key, |c| {
            c.throttled.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_error(&self, reason: &str) {
        let errors = &self.registry.errors;
        if let Some(count) = errors.get(reason) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        errors
            .entry(reason.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let latency = &self.registry.latency;
        latency.total_us.fetch_add(micros, Ordering::Relaxed);
        latency.count.fetch_add(1, Ordering::Relaxed);
        latency.max_us.fetch_max(micros, Ordering::Relaxed);
    }

    fn with_limit(&self, client_id: &str, limit_key: &str, record: impl FnOnce(&LimitCounters)) {
        let name = format!("{}/{}", client_id, limit_key);
        // read lock on the hot path, write lock only for a new key
        if let Some(counters) = self.registry.limits.get(&name) {
            record(counters.value());
            return;
        }
        record(self.registry.limits.entry(name).or_default().value());
    }

    pub fn get_limit_metrics(&self, client_id: &str, limit_key: &str) -> Option<ThrottleMetrics> {
        self.registry
            .limits
            .get(&format!("{}/{}", client_id, limit_key))
            .map(|counters| counters.load())
    }

    pub fn error_count(&self, reason: &str) -> u64 {
        self.registry
            .errors
            .get(reason)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let limits: BTreeMap<String, ThrottleMetrics> = self
            .registry
            .limits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load()))
            .collect();

        let mut global = ThrottleMetrics::default();
        for metrics in limits.values() {
            global.total_requests += metrics.total_requests;
            global.allowed_requests += metrics.allowed_requests;
            global.throttled_requests += metrics.throttled_requests;
        }

        let latency = &self.registry.latency;
        let checks = latency.count.load(Ordering::Relaxed);
        let mean_us = if checks == 0 {
            0.0
        } else {
            latency.total_us.load(Ordering::Relaxed) as f64 / checks as f64
        };

        MetricsSnapshot {
            global,
            limits,
            errors: self
                .registry
                .errors
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            latency: LatencyMetrics {
                checks,
                mean_us,
                max_us: latency.max_us.load(Ordering::Relaxed),
            },
        }
    }

    pub fn reset(&self) {
        self.registry.limits.clear();
        self.registry.errors.clear();
        let latency = &self.registry.latency;
        latency.total_us.store(0, Ordering::Relaxed);
        latency.count.store(0, Ordering::Relaxed);
        latency.max_us.store(0, Ordering::Relaxed);
    }
}
