use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::store::SharedStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store_available: bool,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
    pub circuit_breaker: CircuitState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    service: String,
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        service: impl Into<String>,
        store: Arc<dyn SharedStore>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        // uptime counts from startup, not from the first probe
        std::sync::LazyLock::force(&START_TIME);
        Self {
            service: service.into(),
            store,
            breaker,
            timeout,
        }
    }

    /// `healthy` when the store answers a ping in time, `degraded` otherwise.
    ///
    /// The service keeps answering checks while degraded (subject to the
    /// fail policy), so this never reports `unhealthy`.
    pub async fn check_health(&self) -> HealthStatus {
        let uptime = SystemTime::now()
            .duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let store = self.check_store().await;
        let store_available = store.status == "healthy";

        HealthStatus {
            status: if store_available { "healthy" } else { "degraded" }.to_string(),
            service: self.service.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            store_available,
            dependencies: DependencyStatus {
                store,
                circuit_breaker: self.breaker.state(),
            },
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.store.ping()).await;
        let response_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let error = match result {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some("store did not acknowledge ping".to_string()),
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("ping timed out after {:?}", self.timeout)),
        };
        if let Some(error) = &error {
            warn!(backend = self.store.name(), error = %error, "Store health check failed");
        }

        ServiceStatus {
            backend: self.store.name().to_string(),
            status: if error.is_none() { "healthy" } else { "unavailable" }.to_string(),
            response_time_ms,
            error,
        }
    }
}
