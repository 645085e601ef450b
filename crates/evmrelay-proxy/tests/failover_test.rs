//! Failover integration tests.
//!
//! Each test stands up one or more mock upstream JSON-RPC servers on
//! ephemeral ports and drives the full dispatch stack (store, detector,
//! pool, router) against them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use serde_json::json;

use evmrelay_common::Config;
use evmrelay_proxy::{RateLimitDetector, RequestRouter, WorkerPool};
use evmrelay_store::StatsStore;

// ============================================================================
// Mock upstream server
// ============================================================================

/// One scripted response; after the script runs out the server answers with
/// its default success body.
#[derive(Clone)]
struct Scripted {
    status: u16,
    retry_after: Option<String>,
    body: String,
}

impl Scripted {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

#[derive(Clone)]
struct MockState {
    hits: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    default_body: String,
}

struct MockUpstream {
    url: String,
    hits: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
}

impl MockUpstream {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Append a scripted response after the server is already running.
    fn push_script(&self, scripted: Scripted) {
        self.script.lock().unwrap().push_back(scripted);
    }
}

async fn mock_handler(State(state): State<MockState>, _body: Bytes) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let next = state.script.lock().unwrap().pop_front();
    let (status, retry_after, body) = match next {
        Some(s) => (s.status, s.retry_after, s.body),
        None => (200, None, state.default_body.clone()),
    };
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    if let Some(value) = retry_after {
        builder = builder.header("retry-after", value);
    }
    builder.body(Body::from(body)).unwrap()
}

/// Start a mock upstream on an ephemeral port.
async fn spawn_mock(default_body: impl Into<String>, script: Vec<Scripted>) -> MockUpstream {
    let state = MockState {
        hits: Arc::new(AtomicUsize::new(0)),
        script: Arc::new(Mutex::new(script.into())),
        default_body: default_body.into(),
    };
    let hits = state.hits.clone();
    let script = state.script.clone();
    let app = axum::Router::new().route("/", post(mock_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockUpstream {
        url: format!("http://{addr}"),
        hits,
        script,
    }
}

// ============================================================================
// Stack construction
// ============================================================================

/// Test-scaled configuration: millisecond cooldowns, short timeouts.
fn test_config(endpoints: Vec<String>) -> Config {
    let mut config = Config::default();
    config.endpoints = endpoints;
    config.rate_limit.min_cooldown_ms = 100;
    config.rate_limit.max_cooldown_ms = 800;
    config.worker.request_timeout_ms = 2_000;
    config.worker.health_check_interval_ms = 100;
    config
}

fn build_stack(config: &Config) -> (Arc<StatsStore>, Arc<WorkerPool>, RequestRouter) {
    let store = Arc::new(StatsStore::open_in_memory(config.rate_limit.history_window_size).unwrap());
    let detector = Arc::new(RateLimitDetector::new(config.rate_limit.clone(), store.clone()));
    let pool = Arc::new(WorkerPool::new(config, store.clone(), detector).unwrap());
    let router = RequestRouter::new(pool.clone());
    (store, pool, router)
}

fn rpc_body(method: &str) -> Bytes {
    Bytes::from(
        serde_json::to_vec(&json!({"jsonrpc": "2.0", "method": method, "params": [], "id": 1}))
            .unwrap(),
    )
}

// ============================================================================
// Failover behavior
// ============================================================================

#[tokio::test]
async fn test_single_endpoint_failure_recovery() {
    // A answers with a transient RPC error, B with a result; the client sees
    // B's result and each endpoint is contacted exactly once.
    let a = spawn_mock(
        r#"{"jsonrpc":"2.0","error":{"code":14,"message":"GRPC Context cancellation"},"id":1}"#,
        vec![],
    )
    .await;
    let b = spawn_mock(r#"{"jsonrpc":"2.0","result":"0x1","id":1}"#, vec![]).await;

    let config = test_config(vec![a.url.clone(), b.url.clone()]);
    let (store, _pool, router) = build_stack(&config);

    let reply = router.route("eth_chainId", rpc_body("eth_chainId")).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body["result"], json!("0x1"));

    assert_eq!(a.hits(), 1);
    assert_eq!(b.hits(), 1);

    let stats = store.endpoint_statistics().unwrap();
    let a_stats = stats.iter().find(|s| s.url == a.url).unwrap();
    let b_stats = stats.iter().find(|s| s.url == b.url).unwrap();
    assert_eq!(a_stats.failed_requests, 1);
    assert_eq!(a_stats.successful_requests, 0);
    assert_eq!(b_stats.successful_requests, 1);

    let log = store.recent_requests(a_stats.endpoint_id, 10).unwrap();
    assert_eq!(log.len(), 1);
    assert!(!log[0].success);
    assert!(log[0].error_message.as_deref().unwrap().contains("GRPC"));
}

#[tokio::test]
async fn test_cascading_transients_exhaust_retries() {
    // All three endpoints answer with transient errors: the request fails
    // terminally, and under the 2 x |workers| budget each endpoint is
    // contacted exactly twice.
    let transient = r#"{"jsonrpc":"2.0","error":{"code":19,"message":"Temporary internal error"},"id":1}"#;
    let a = spawn_mock(transient, vec![]).await;
    let b = spawn_mock(transient, vec![]).await;
    let c = spawn_mock(transient, vec![]).await;

    let config = test_config(vec![a.url.clone(), b.url.clone(), c.url.clone()]);
    let (store, _pool, router) = build_stack(&config);

    let err = router.route("eth_chainId", rpc_body("eth_chainId")).await.unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("All RPC endpoints failed:"), "got: {message}");

    assert_eq!(a.hits(), 2);
    assert_eq!(b.hits(), 2);
    assert_eq!(c.hits(), 2);

    let stats = store.endpoint_statistics().unwrap();
    let failures: u64 = stats.iter().map(|s| s.failed_requests).sum();
    assert_eq!(failures, 6);
}

#[tokio::test]
async fn test_rate_limit_cooldown_and_connection_hold() {
    // A single endpoint rate-limits with Retry-After: 1, then recovers. The
    // client connection is held through the cooldown and succeeds; exactly
    // one rate-limit event is recorded with the advertised cooldown.
    let a = spawn_mock(
        r#"{"jsonrpc":"2.0","result":"0x10","id":1}"#,
        vec![Scripted::new(429, r#"{"error":"Too Many Requests"}"#).with_retry_after("1")],
    )
    .await;

    let config = test_config(vec![a.url.clone()]);
    let (store, pool, router) = build_stack(&config);

    let started = Instant::now();
    let reply = router.route("eth_blockNumber", rpc_body("eth_blockNumber")).await.unwrap();
    let elapsed = started.elapsed();

    let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body["result"], json!("0x10"));
    assert!(elapsed >= Duration::from_secs(1), "cooldown was not honored: {elapsed:?}");
    assert_eq!(a.hits(), 2);

    let stats = &store.endpoint_statistics().unwrap()[0];
    assert_eq!(stats.rate_limited_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    // Retry-After: 1 second, below the backoff minimum, is honored as-is
    assert_eq!(store.average_cooldown(stats.endpoint_id, 7).unwrap(), Some(1_000));

    assert!(pool.all()[0].is_available());
}

#[tokio::test]
async fn test_repeated_rate_limits_hold_through_each_cooldown() {
    // Two 503s without Retry-After: the worker cools down, retries the same
    // queued request first, cools down again, and finally delivers. Every
    // cooldown expiry resets the strike streak, so each detection chooses
    // the base cooldown (100ms with the test bounds).
    let a = spawn_mock(
        r#"{"jsonrpc":"2.0","result":"0x2a","id":1}"#,
        vec![
            Scripted::new(503, r#"{"error":"Service Unavailable"}"#),
            Scripted::new(503, r#"{"error":"Service Unavailable"}"#),
        ],
    )
    .await;

    let config = test_config(vec![a.url.clone()]);
    let (store, _pool, router) = build_stack(&config);

    let started = Instant::now();
    let reply = router.route("eth_call", rpc_body("eth_call")).await.unwrap();
    let elapsed = started.elapsed();

    let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(body["result"], json!("0x2a"));
    assert!(elapsed >= Duration::from_millis(200), "expected two 100ms cooldowns, got {elapsed:?}");
    assert_eq!(a.hits(), 3);

    let stats = &store.endpoint_statistics().unwrap()[0];
    assert_eq!(stats.rate_limited_requests, 2);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(store.average_cooldown(stats.endpoint_id, 7).unwrap(), Some(100));
}

#[tokio::test]
async fn test_permanent_error_is_forwarded_verbatim() {
    // A well-formed non-transient error is a correct answer: it is returned
    // byte-identical, the second endpoint is never contacted, and the
    // statistics count a success.
    let envelope = r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"Method not found"},"id":1}"#;
    let a = spawn_mock(envelope, vec![]).await;
    let b = spawn_mock(r#"{"jsonrpc":"2.0","result":"0x1","id":1}"#, vec![]).await;

    let config = test_config(vec![a.url.clone(), b.url.clone()]);
    let (store, _pool, router) = build_stack(&config);

    let reply = router.route("eth_doesNotExist", rpc_body("eth_doesNotExist")).await.unwrap();
    assert_eq!(&reply.body[..], envelope.as_bytes());

    assert_eq!(a.hits(), 1);
    assert_eq!(b.hits(), 0);

    let stats = store.endpoint_statistics().unwrap();
    let a_stats = stats.iter().find(|s| s.url == a.url).unwrap();
    assert_eq!(a_stats.successful_requests, 1);
    assert_eq!(a_stats.failed_requests, 0);

    let log = store.recent_requests(a_stats.endpoint_id, 10).unwrap();
    assert!(log[0].success);
}

#[tokio::test]
async fn test_responses_pass_through_byte_identical() {
    // Whitespace and key order survive the proxy untouched.
    let quirky = "{ \"id\" : 1 , \"result\" : \"0xdeadbeef\", \"jsonrpc\" :\"2.0\" }";
    let a = spawn_mock(quirky, vec![]).await;

    let config = test_config(vec![a.url.clone()]);
    let (_store, _pool, router) = build_stack(&config);

    let reply = router.route("eth_getBalance", rpc_body("eth_getBalance")).await.unwrap();
    assert_eq!(&reply.body[..], quirky.as_bytes());
}

#[tokio::test]
async fn test_strike_reset_after_success() {
    // After a success breaks the streak, a later rate limit starts over at
    // the base cooldown instead of continuing the exponential ladder.
    let a = spawn_mock(
        r#"{"jsonrpc":"2.0","result":"0x1","id":1}"#,
        vec![Scripted::new(503, r#"{"error":"Service Unavailable"}"#)],
    )
    .await;

    let config = test_config(vec![a.url.clone()]);
    let (store, _pool, router) = build_stack(&config);

    // first request: one 503 (100ms cooldown) then success
    router.route("eth_call", rpc_body("eth_call")).await.unwrap();

    // second request hits a fresh 503; the success in between reset the
    // strike count, so the chosen cooldown is the base 100ms again
    a.push_script(Scripted::new(503, r#"{"error":"Service Unavailable"}"#));
    router.route("eth_call", rpc_body("eth_call")).await.unwrap();

    let stats = &store.endpoint_statistics().unwrap()[0];
    assert_eq!(stats.rate_limited_requests, 2);
    assert_eq!(stats.successful_requests, 2);
    // both events chose 100ms, so the average is exactly the base value
    assert_eq!(store.average_cooldown(stats.endpoint_id, 7).unwrap(), Some(100));
}
