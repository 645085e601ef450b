//! Per-endpoint serialized dispatch.
//!
//! Each upstream endpoint is owned by exactly one [`EndpointWorker`]: a
//! bounded FIFO queue drained by a single long-lived task. That task is the
//! only writer of the worker's state, which keeps the state machine free of
//! interleavings:
//!
//! ```text
//!               enqueue
//!    Healthy ───────────► Healthy        (success / permanent error)
//!       │                    ▲
//!       │ rate-limit         │ cooldown expired
//!       ▼                    │
//!   CoolingDown ─────────────┘
//!       │
//!       │ consecutive transport failures reach the threshold
//!       ▼
//!     Error ──── probe success ────► Healthy
//! ```
//!
//! A rate-limited request is never surfaced to the router: the worker
//! re-inserts it at the *head* of the queue and sleeps through the cooldown,
//! so the same request is retried first the moment the endpoint is usable
//! again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hyper::body::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, warn};

use evmrelay_common::config::WorkerConfig;
use evmrelay_common::error::{ProxyError, Result};
use evmrelay_store::StatsStore;

use crate::detector::{parse_retry_after, DetectionInput, RateLimitDetector, TransportFailure};

/// JSON-RPC error codes classified as transient (retryable on another
/// endpoint).
const TRANSIENT_RPC_CODES: &[i64] = &[19, -32000, -32603, 429, 503];

/// Message fragments classifying a JSON-RPC error as transient.
const TRANSIENT_RPC_KEYWORDS: &[&str] = &[
    "temporary",
    "retry",
    "timeout",
    "timed out",
    "unavailable",
    "connection",
    "network",
    "try again",
    "overloaded",
    "capacity",
    "grpc",
    "cancel",
];

/// Granularity of the cooldown sleep, so a shortened cooldown or a shutdown
/// signal is observed promptly.
const COOLDOWN_TICK: Duration = Duration::from_secs(1);

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Healthy,
    CoolingDown,
    Error,
}

/// A terminal upstream response: the verbatim body (which may itself be a
/// well-formed JSON-RPC error envelope) and the HTTP status it came with.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub http_status: u16,
    pub body: Bytes,
}

/// Read-only snapshot for `/stats` and logging.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub url: String,
    pub state: WorkerState,
    pub queue_length: usize,
    pub cooldown_remaining_ms: u64,
    pub consecutive_transport_failures: u32,
}

struct QueueItem {
    method: String,
    body: Bytes,
    reply: oneshot::Sender<Result<UpstreamReply>>,
}

struct StateCell {
    state: WorkerState,
    cooldown_until: Option<Instant>,
}

struct WorkerInner {
    endpoint_id: i64,
    url: String,
    cfg: WorkerConfig,
    http: reqwest::Client,
    detector: Arc<RateLimitDetector>,
    store: Arc<StatsStore>,
    queue: Mutex<VecDeque<QueueItem>>,
    state: Mutex<StateCell>,
    notify: Notify,
    transport_failures: AtomicU32,
}

/// The serialized agent owning the queue and HTTP client for one endpoint.
#[derive(Clone)]
pub struct EndpointWorker {
    inner: Arc<WorkerInner>,
}

impl EndpointWorker {
    pub fn new(
        endpoint_id: i64,
        url: String,
        cfg: WorkerConfig,
        http: reqwest::Client,
        detector: Arc<RateLimitDetector>,
        store: Arc<StatsStore>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                endpoint_id,
                url,
                cfg,
                http,
                detector,
                store,
                queue: Mutex::new(VecDeque::new()),
                state: Mutex::new(StateCell {
                    state: WorkerState::Healthy,
                    cooldown_until: None,
                }),
                notify: Notify::new(),
                transport_failures: AtomicU32::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn endpoint_id(&self) -> i64 {
        self.inner.endpoint_id
    }

    /// Queue a request for this endpoint.
    ///
    /// Fails immediately with [`ProxyError::QueueFull`] at capacity.
    /// Otherwise the returned receiver completes once this endpoint (and
    /// only this endpoint) produced a terminal outcome. Dropping the
    /// receiver abandons the request: a queued item whose receiver is gone
    /// is skipped when dequeued.
    pub fn enqueue(&self, method: &str, body: Bytes) -> Result<oneshot::Receiver<Result<UpstreamReply>>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock().expect("worker queue lock poisoned");
            if queue.len() >= self.inner.cfg.max_queue_size {
                return Err(ProxyError::QueueFull);
            }
            queue.push_back(QueueItem {
                method: method.to_string(),
                body,
                reply: tx,
            });
        }
        self.inner.notify.notify_one();
        Ok(rx)
    }

    /// False while cooling down or in the ERROR state. A cooldown that has
    /// already expired counts as available even before the drain loop has
    /// observed the expiry.
    pub fn is_available(&self) -> bool {
        let cell = self.inner.state.lock().expect("worker state lock poisoned");
        match cell.state {
            WorkerState::Healthy => true,
            WorkerState::Error => false,
            WorkerState::CoolingDown => match cell.cooldown_until {
                Some(until) => Instant::now() >= until,
                None => true,
            },
        }
    }

    pub fn queue_length(&self) -> usize {
        self.inner.queue.lock().expect("worker queue lock poisoned").len()
    }

    /// Time until the cooldown expires, or zero when not cooling down.
    pub fn recovery_time(&self) -> Duration {
        let cell = self.inner.state.lock().expect("worker state lock poisoned");
        match (cell.state, cell.cooldown_until) {
            (WorkerState::CoolingDown, Some(until)) => until.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let (state, cooldown_remaining_ms) = {
            let cell = self.inner.state.lock().expect("worker state lock poisoned");
            let remaining = match (cell.state, cell.cooldown_until) {
                (WorkerState::CoolingDown, Some(until)) => {
                    until.saturating_duration_since(Instant::now()).as_millis() as u64
                }
                _ => 0,
            };
            (cell.state, remaining)
        };
        WorkerStatus {
            url: self.inner.url.clone(),
            state,
            queue_length: self.queue_length(),
            cooldown_remaining_ms,
            consecutive_transport_failures: self.inner.transport_failures.load(Ordering::Relaxed),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state.lock().expect("worker state lock poisoned").state
    }

    /// Probe-path recovery: back to HEALTHY with cooldown, strikes, and the
    /// transport-failure streak cleared. Wakes the drain loop.
    pub fn mark_recovered(&self) {
        {
            let mut cell = self.inner.state.lock().expect("worker state lock poisoned");
            cell.state = WorkerState::Healthy;
            cell.cooldown_until = None;
        }
        self.inner.transport_failures.store(0, Ordering::Relaxed);
        self.inner.detector.reset_strikes(self.inner.endpoint_id);
        self.inner.notify.notify_one();
        info!(url = %self.inner.url, "endpoint recovered via health probe");
    }

    /// Run the drain loop until shutdown. Spawned once per worker by the
    /// pool; the single-consumer property is what serializes upstream
    /// traffic per endpoint.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let inner = &self.inner;
        loop {
            // Park until there is work. Shutdown with an empty queue ends
            // the loop; queued work is drained first. A closed shutdown
            // channel counts as a shutdown signal.
            loop {
                if self.queue_length() > 0 {
                    break;
                }
                if *shutdown.borrow() {
                    return;
                }
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            // An ERROR worker holds its queue until a probe restores it.
            if self.state() == WorkerState::Error {
                if *shutdown.borrow() {
                    self.fail_pending("shutting down while endpoint is in error state");
                    return;
                }
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            self.fail_pending("worker pool dropped while endpoint is in error state");
                            return;
                        }
                    }
                }
                continue;
            }

            // Cooldown gate: no items are consumed while the cooldown is
            // pending; expiry transitions back to HEALTHY and clears the
            // endpoint's strike streak.
            let cooldown_remaining = {
                let cell = inner.state.lock().expect("worker state lock poisoned");
                match (cell.state, cell.cooldown_until) {
                    (WorkerState::CoolingDown, Some(until)) => {
                        Some(until.saturating_duration_since(Instant::now()))
                    }
                    _ => None,
                }
            };
            match cooldown_remaining {
                Some(remaining) if !remaining.is_zero() => {
                    tokio::time::sleep(remaining.min(COOLDOWN_TICK)).await;
                    continue;
                }
                Some(_) => {
                    {
                        let mut cell = inner.state.lock().expect("worker state lock poisoned");
                        cell.state = WorkerState::Healthy;
                        cell.cooldown_until = None;
                    }
                    inner.detector.reset_strikes(inner.endpoint_id);
                    info!(url = %inner.url, "cooldown expired, endpoint healthy again");
                }
                None => {}
            }

            let Some(item) = inner.queue.lock().expect("worker queue lock poisoned").pop_front()
            else {
                continue;
            };
            if item.reply.is_closed() {
                debug!(url = %inner.url, method = %item.method, "dropping abandoned request");
                continue;
            }

            self.process(item).await;
        }
    }

    /// One upstream exchange for the head-of-queue item.
    async fn process(&self, item: QueueItem) {
        let inner = &self.inner;
        let started = Instant::now();
        let exchange = self.exchange(&item.body).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match exchange {
            Ok(raw) => {
                inner.transport_failures.store(0, Ordering::Relaxed);
                let json: Option<Value> = serde_json::from_slice(&raw.body).ok();
                let verdict = inner.detector.detect(
                    inner.endpoint_id,
                    &DetectionInput {
                        http_status: Some(raw.http_status),
                        body: json.as_ref(),
                        transport_error: None,
                        retry_after: raw.retry_after,
                        response_time: elapsed,
                    },
                );
                if verdict.rate_limited {
                    self.enter_cooldown(&verdict, Some(raw.http_status), None, item);
                    return;
                }

                let error_obj = json
                    .as_ref()
                    .and_then(|v| v.get("error"))
                    .filter(|e| !e.is_null());
                if let Some(error_obj) = error_obj {
                    if is_transient_rpc_error(error_obj) {
                        let message = error_message(error_obj);
                        debug!(
                            url = %inner.url,
                            method = %item.method,
                            error = %message,
                            "transient upstream error, handing back for failover"
                        );
                        self.record(&item.method, false, elapsed_ms, Some(raw.http_status), Some(&message));
                        let _ = item.reply.send(Err(ProxyError::TransientUpstream(error_obj.clone())));
                        return;
                    }
                    // A well-formed permanent error is a correct upstream
                    // response; it counts as success and is forwarded
                    // verbatim.
                }

                debug!(url = %inner.url, method = %item.method, elapsed_ms, "upstream responded");
                self.record(&item.method, true, elapsed_ms, Some(raw.http_status), None);
                let _ = item.reply.send(Ok(UpstreamReply {
                    http_status: raw.http_status,
                    body: raw.body,
                }));
            }
            Err(err) => {
                let failure = TransportFailure::from_reqwest(&err);
                let verdict = inner.detector.detect(
                    inner.endpoint_id,
                    &DetectionInput {
                        http_status: None,
                        body: None,
                        transport_error: Some(&failure),
                        retry_after: None,
                        response_time: elapsed,
                    },
                );
                if verdict.rate_limited {
                    self.enter_cooldown(&verdict, None, Some(&failure.message), item);
                    return;
                }

                self.record(&item.method, false, elapsed_ms, None, Some(&failure.message));
                let failures = inner.transport_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= inner.cfg.error_threshold {
                    {
                        let mut cell = inner.state.lock().expect("worker state lock poisoned");
                        cell.state = WorkerState::Error;
                        cell.cooldown_until = None;
                    }
                    warn!(
                        url = %inner.url,
                        consecutive_failures = failures,
                        "endpoint moved to error state, awaiting health probe"
                    );
                } else {
                    warn!(url = %inner.url, error = %failure.message, "transport failure");
                }
                let _ = item.reply.send(Err(ProxyError::Transport(failure.message)));
            }
        }
    }

    async fn exchange(&self, body: &Bytes) -> std::result::Result<RawResponse, reqwest::Error> {
        let response = self
            .inner
            .http
            .post(&self.inner.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await?;
        let http_status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.bytes().await?;
        Ok(RawResponse {
            http_status,
            retry_after,
            body,
        })
    }

    /// Rate-limit branch of the drain loop: persist the event, enter
    /// COOLING_DOWN, and put the item back at the head of the queue so it is
    /// retried first once the cooldown expires.
    fn enter_cooldown(
        &self,
        verdict: &crate::detector::Verdict,
        http_status: Option<u16>,
        message: Option<&str>,
        item: QueueItem,
    ) {
        let inner = &self.inner;
        let cooldown_ms = verdict.cooldown.as_millis() as u64;
        if let Err(err) =
            inner.store.record_rate_limit_event(inner.endpoint_id, cooldown_ms, http_status, message)
        {
            warn!(url = %inner.url, %err, "failed to persist rate-limit event");
        }
        {
            let mut cell = inner.state.lock().expect("worker state lock poisoned");
            cell.state = WorkerState::CoolingDown;
            cell.cooldown_until = Some(Instant::now() + verdict.cooldown);
        }
        warn!(
            url = %inner.url,
            cooldown_ms,
            confidence = verdict.confidence,
            signals = ?verdict.signals,
            "endpoint rate limited, cooling down"
        );
        inner
            .queue
            .lock()
            .expect("worker queue lock poisoned")
            .push_front(item);
    }

    fn record(
        &self,
        method: &str,
        success: bool,
        response_time_ms: u64,
        http_status: Option<u16>,
        error_message: Option<&str>,
    ) {
        if let Err(err) = self.inner.store.record_request(
            self.inner.endpoint_id,
            method,
            success,
            response_time_ms,
            http_status,
            error_message,
        ) {
            warn!(url = %self.inner.url, %err, "failed to record request outcome");
        }
    }

    fn fail_pending(&self, reason: &str) {
        let mut queue = self.inner.queue.lock().expect("worker queue lock poisoned");
        for item in queue.drain(..) {
            let _ = item.reply.send(Err(ProxyError::WorkerUnavailable(reason.to_string())));
        }
    }
}

struct RawResponse {
    http_status: u16,
    retry_after: Option<Duration>,
    body: Bytes,
}

/// Transient iff the code is in the known-retryable set or the message
/// carries a retryable fragment.
fn is_transient_rpc_error(error: &Value) -> bool {
    if let Some(code) = error.get("code").and_then(Value::as_i64) {
        if TRANSIENT_RPC_CODES.contains(&code) {
            return true;
        }
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    TRANSIENT_RPC_KEYWORDS.iter().any(|k| message.contains(k))
}

fn error_message(error: &Value) -> String {
    match error.get("message").and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmrelay_common::config::RateLimitConfig;
    use serde_json::json;

    fn worker_fixture(max_queue_size: usize) -> EndpointWorker {
        let store = Arc::new(StatsStore::open_in_memory(20).unwrap());
        let endpoint_id = store.ensure_endpoint("https://rpc.example.org").unwrap();
        let detector = Arc::new(RateLimitDetector::new(RateLimitConfig::default(), store.clone()));
        let cfg = WorkerConfig {
            max_queue_size,
            ..Default::default()
        };
        EndpointWorker::new(
            endpoint_id,
            "https://rpc.example.org".into(),
            cfg,
            reqwest::Client::new(),
            detector,
            store,
        )
    }

    #[test]
    fn test_transient_rpc_error_codes() {
        for code in [19, -32000, -32603, 429, 503] {
            assert!(
                is_transient_rpc_error(&json!({"code": code, "message": "whatever"})),
                "code {code} should be transient"
            );
        }
        assert!(!is_transient_rpc_error(&json!({"code": -32601, "message": "Method not found"})));
        assert!(!is_transient_rpc_error(&json!({"code": 3, "message": "execution reverted"})));
    }

    #[test]
    fn test_transient_rpc_error_keywords() {
        assert!(is_transient_rpc_error(&json!({"code": 14, "message": "GRPC Context cancellation"})));
        assert!(is_transient_rpc_error(&json!({"code": 1, "message": "please try again later"})));
        assert!(is_transient_rpc_error(&json!({"code": 1, "message": "Service Unavailable"})));
        assert!(is_transient_rpc_error(&json!({"message": "network hiccup"})));
        assert!(!is_transient_rpc_error(&json!({"code": 1, "message": "invalid argument"})));
        assert!(!is_transient_rpc_error(&json!({})));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(&json!({"code": 1, "message": "boom"})), "boom");
        assert_eq!(error_message(&json!({"code": 1})), r#"{"code":1}"#);
    }

    #[test]
    fn test_queue_full() {
        let worker = worker_fixture(2);
        let _rx1 = worker.enqueue("eth_chainId", Bytes::from_static(b"{}")).unwrap();
        let _rx2 = worker.enqueue("eth_chainId", Bytes::from_static(b"{}")).unwrap();
        let err = worker.enqueue("eth_chainId", Bytes::from_static(b"{}")).unwrap_err();
        assert!(matches!(err, ProxyError::QueueFull));
        assert_eq!(worker.queue_length(), 2);
    }

    #[test]
    fn test_new_worker_is_available() {
        let worker = worker_fixture(10);
        assert!(worker.is_available());
        assert_eq!(worker.state(), WorkerState::Healthy);
        assert_eq!(worker.recovery_time(), Duration::ZERO);
        assert_eq!(worker.queue_length(), 0);
    }

    #[test]
    fn test_cooldown_affects_availability() {
        let worker = worker_fixture(10);
        {
            let mut cell = worker.inner.state.lock().unwrap();
            cell.state = WorkerState::CoolingDown;
            cell.cooldown_until = Some(Instant::now() + Duration::from_secs(30));
        }
        assert!(!worker.is_available());
        assert!(worker.recovery_time() > Duration::from_secs(29));

        // an expired cooldown no longer blocks availability
        {
            let mut cell = worker.inner.state.lock().unwrap();
            cell.cooldown_until = Some(Instant::now() - Duration::from_millis(1));
        }
        assert!(worker.is_available());
        assert_eq!(worker.recovery_time(), Duration::ZERO);
    }

    #[test]
    fn test_error_state_blocks_until_recovered() {
        let worker = worker_fixture(10);
        {
            let mut cell = worker.inner.state.lock().unwrap();
            cell.state = WorkerState::Error;
        }
        worker.inner.transport_failures.store(3, Ordering::Relaxed);
        assert!(!worker.is_available());

        worker.mark_recovered();
        assert!(worker.is_available());
        assert_eq!(worker.state(), WorkerState::Healthy);
        assert_eq!(worker.status().consecutive_transport_failures, 0);
    }

    #[test]
    fn test_status_snapshot() {
        let worker = worker_fixture(10);
        let _rx = worker.enqueue("eth_call", Bytes::from_static(b"{}")).unwrap();
        let status = worker.status();
        assert_eq!(status.url, "https://rpc.example.org");
        assert_eq!(status.state, WorkerState::Healthy);
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.cooldown_remaining_ms, 0);
    }
}
