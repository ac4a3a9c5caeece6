use crate::algorithms;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::handlers::{
    check_limit, circuit_breaker_status, get_rules, health_check, metrics, update_rule, AppState,
    SharedState,
};
use crate::health::HealthChecker;
use crate::metrics::MetricsCollector;
use crate::middleware::{correlation_id_middleware, logging_middleware};
use crate::rate_limit_config::RuleBook;
use crate::store::{MemoryStore, RedisStore, SharedStore};
use crate::throttler::{FailMode, Throttler};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/v1/check", post(check_limit))
        .route("/v1/admin/rules", post(update_rule))
        .route("/rules", get(get_rules))
        .route("/circuit-breaker-status", get(circuit_breaker_status))
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(correlation_id_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

/// Wire store, algorithm, breaker and rules into the shared state.
pub fn build_state(
    config: &Config,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
) -> ThrottlerResult<SharedState> {
    let rules = config.load_rules()?;
    ConfigValidator::validate_rules(&rules)?;
    let settings = config.throttler_settings()?;
    let breaker_config = config.breaker_config();
    ConfigValidator::validate_breaker(&breaker_config)?;

    let breaker = Arc::new(CircuitBreaker::with_clock(breaker_config, clock.clone()));
    let algorithm = algorithms::build(config.algorithm_kind()?, store.clone(), clock.clone());

    let health = HealthChecker::new(
        config.service_name.clone(),
        store,
        breaker.clone(),
        settings.store_timeout,
    );
    let throttler = Throttler::new(
        RuleBook::new(rules),
        algorithm,
        breaker,
        settings,
        MetricsCollector::new(),
        clock,
    );

    Ok(Arc::new(AppState { throttler, health }))
}

pub struct Server {
    app: Router,
    addr: SocketAddr,
}

impl Server {
    pub async fn new(config: Config) -> ThrottlerResult<Self> {
        ConfigValidator::validate_config(&config)?;
        let addr = ConfigValidator::validate_bind_address(&config.bind_addr)?;
        let fail_mode = config.throttler_settings()?.fail_mode;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn SharedStore> = if config.memory_store {
            warn!("Using in-process store; limits are not shared between replicas");
            Arc::new(MemoryStore::new(clock.clone()))
        } else {
            let redis = RedisStore::new(&config.redis_url)
                .map_err(|e| ThrottlerError::ConfigurationError(e.to_string()))?;
            match redis.connect().await {
                Ok(()) => {}
                Err(err) if fail_mode == FailMode::Closed => {
                    error!(error = %err, "Redis unreachable at startup");
                    return Err(ThrottlerError::ServiceUnavailable);
                }
                Err(err) => warn!(error = %err, "Redis unreachable at startup, failing open until it recovers"),
            }
            Arc::new(redis)
        };

        let state = build_state(&config, store, clock)?;
        info!(
            service = %config.service_name,
            algorithm = %state.throttler.algorithm_kind(),
            fail_mode = %state.throttler.settings().fail_mode,
            "Rate limiter configured"
        );

        Ok(Self {
            app: create_app(state),
            addr,
        })
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!("Rate limiter listening on {}", self.addr);
        info!("Health check available at /health");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
