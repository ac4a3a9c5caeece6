use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use envconfig::Envconfig;
use http_body_util::BodyExt;
use limiter::{
    circuit_breaker::CircuitState,
    clock::ManualClock,
    config::Config,
    create_app,
    handlers::SharedState,
    rate_limit_config::RateLimitRule,
    server::build_state,
    store::MemoryStore,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const T0: u64 = 1_700_000_000_000;

struct TestApp {
    router: Router,
    state: SharedState,
    clock: ManualClock,
}

impl TestApp {
    fn new(env: &[(&str, &str)]) -> Self {
        let mut vars: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.insert("MEMORY_STORE".into(), "true".into());
        let config = Config::init_from_hashmap(&vars).unwrap();

        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let state = build_state(&config, store, Arc::new(clock.clone())).unwrap();

        Self {
            router: create_app(state.clone()),
            state,
            clock,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Response {
        self.router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> Response {
        self.router
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn check(&self, client_id: &str, limit_key: &str, cost: u32) -> (StatusCode, Value) {
        let response = self
            .post(
                "/v1/check",
                json!({"client_id": client_id, "limit_key": limit_key, "cost": cost}),
            )
            .await;
        let status = response.status();
        (status, body_json(response).await)
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_check_allowed_with_headers() {
    let app = TestApp::new(&[]);
    let response = app.post("/v1/check", json!({"client_id": "client_a"})).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "100");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
    assert!(response.headers().contains_key("x-ratelimit-reset"));
    assert!(response.headers().contains_key("x-correlation-id"));

    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["limit"], 100);
    assert_eq!(body["window"], 60);
    assert_eq!(body["retry_after_ms"], 0);
    assert_eq!(body["reset_at"], T0 as f64 / 1000.0 + 60.0);
}

#[tokio::test]
async fn test_exhaustion_returns_429_then_recovers() {
    let app = TestApp::new(&[]);
    let rule = app
        .post(
            "/v1/admin/rules",
            json!({"client_id": "client_b", "rate": 2, "window": 10}),
        )
        .await;
    assert_eq!(rule.status(), StatusCode::OK);

    for expected in [1, 0] {
        let (status, body) = app.check("client_b", "global", 1).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], expected);
    }

    let denied = app
        .post("/v1/check", json!({"client_id": "client_b"}))
        .await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["retry-after"], "5");
    let body = body_json(denied).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["retry_after_ms"], 5_000);

    app.clock.advance(Duration::from_secs(5));
    let (status, _) = app.check("client_b", "global", 1).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_invalid_requests_rejected_at_boundary() {
    let app = TestApp::new(&[]);

    let (status, body) = app.check("client_a", "global", 0).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = app.check("bad client", "global", 1).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let negative = app
        .post("/v1/check", json!({"client_id": "client_a", "cost": -3}))
        .await;
    assert!(negative.status().is_client_error());

    let rule = app
        .post("/v1/admin/rules", json!({"client_id": "c", "rate": 0, "window": 10}))
        .await;
    assert_eq!(rule.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_endpoint_rule_update_is_visible() {
    let app = TestApp::new(&[]);
    let response = app
        .post(
            "/v1/admin/rules",
            json!({"client_id": "client_a", "rate": 20, "window": 60, "endpoint": "login"}),
        )
        .await;
    let info = body_json(response).await;
    assert_eq!(info["endpoint"], "login");

    let rules = body_json(app.get("/rules").await).await;
    assert_eq!(rules["default"]["rate"], 100);
    assert_eq!(rules["clients"]["client_a"]["endpoints"]["login"]["rate"], 20);

    let (_, login) = app.check("client_a", "login", 1).await;
    assert_eq!(login["limit"], 20);
    let (_, other) = app.check("client_a", "search", 1).await;
    assert_eq!(other["limit"], 100);
}

#[tokio::test]
async fn test_clients_and_keys_isolated() {
    let app = TestApp::new(&[("ALGORITHM", "fixed_window")]);
    app.state
        .throttler
        .rules()
        .upsert_client("client_a", RateLimitRule::new(3, 60))
        .unwrap();

    for _ in 0..3 {
        app.check("client_a", "global", 1).await;
    }
    let (status, _) = app.check("client_a", "global", 1).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, body) = app.check("client_a", "export", 1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 2);
    let (status, body) = app.check("client_z", "global", 1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 99);
}

#[tokio::test]
async fn test_sliding_window_accuracy() {
    let app = TestApp::new(&[("ALGORITHM", "sliding_window")]);
    app.state
        .throttler
        .rules()
        .upsert_client("client_s", RateLimitRule::new(10, 10))
        .unwrap();

    for _ in 0..10 {
        let (status, _) = app.check("client_s", "global", 1).await;
        assert_eq!(status, StatusCode::OK);
    }

    app.clock.advance(Duration::from_secs(5));
    let (status, _) = app.check("client_s", "global", 1).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    app.clock.advance(Duration::from_millis(5_100));
    let (status, _) = app.check("client_s", "global", 1).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_high_cost_request() {
    let app = TestApp::new(&[]);

    let (_, first) = app.check("client_h", "global", 10).await;
    assert_eq!(first["remaining"], 90);

    let (status, denied) = app.check("client_h", "global", 95).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied["remaining"], 90);

    let (status, _) = app.check("client_h", "global", 90).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_open_breaker_fail_open() {
    let app = TestApp::new(&[("FAIL_MODE", "open")]);
    app.state.throttler.breaker().trip();

    for client in ["a", "b"] {
        let (status, body) = app.check(client, "global", 1).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);
        assert_eq!(body["remaining"], 100);
    }

    let status = body_json(app.get("/circuit-breaker-status").await).await;
    assert_eq!(status["state"], "open");
    assert_eq!(status["failure_threshold"], 5);
    assert_eq!(status["recovery_timeout"], "1m");

    let metrics = body_json(app.get("/metrics").await).await;
    assert_eq!(metrics["errors"]["breaker_open"], 2);
}

#[tokio::test]
async fn test_open_breaker_fail_closed() {
    let app = TestApp::new(&[("FAIL_MODE", "closed")]);
    app.state.throttler.breaker().trip();

    let response = app.post("/v1/check", json!({"client_id": "a"})).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));
    assert!(!response.headers().contains_key("x-ratelimit-remaining"));
    let body = body_json(response).await;
    assert_eq!(body["error"], "service_unavailable");
    assert!(body.get("allowed").is_none());

    app.clock.advance(Duration::from_secs(60));
    let (status, _) = app.check("a", "global", 1).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.state.throttler.breaker().state(), CircuitState::HalfOpen);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let app = TestApp::new(&[("SERVICE_NAME", "limiter-test")]);
    app.check("client_a", "global", 1).await;

    let health = app.get("/health").await;
    assert_eq!(health.status(), StatusCode::OK);
    let health = body_json(health).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "limiter-test");
    assert_eq!(health["store_available"], true);

    let metrics = body_json(app.get("/metrics").await).await;
    assert_eq!(metrics["algorithm"], "token_bucket");
    assert_eq!(metrics["fail_mode"], "open");
    assert_eq!(metrics["global"]["allowed_requests"], 1);
    assert_eq!(metrics["limits"]["client_a/global"]["total_requests"], 1);
    assert_eq!(metrics["latency"]["checks"], 1);
}

#[tokio::test]
async fn test_correlation_id_round_trip() {
    let app = TestApp::new(&[]);
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("X-Correlation-ID", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let response = tokio_test::assert_ok!(response);
    assert_eq!(response.headers()["x-correlation-id"], "req-42");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_share_one_budget() {
    let app = Arc::new(TestApp::new(&[("ALGORITHM", "sliding_window")]));
    app.state
        .throttler
        .rules()
        .upsert_client("hot", RateLimitRule::new(20, 60))
        .unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { app.check("hot", "global", 1).await.0 })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusCode::OK {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 20);
}
