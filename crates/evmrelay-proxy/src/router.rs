//! Failover routing across the worker pool.
//!
//! One router call serves one client request, possibly contacting several
//! endpoints in sequence. Two guarantees shape the loop:
//!
//! - **No speculative fan-out**: retries are sequential; at any moment the
//!   request is queued on at most one worker.
//! - **Connection hold**: while every endpoint is unavailable the router
//!   sleeps until the nearest recovery (capped at five seconds) instead of
//!   failing the request. Errors only surface once the retry budget of
//!   `2 × |workers|` attempts is spent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Bytes;
use tracing::{debug, warn};

use evmrelay_common::error::{ProxyError, Result};

use crate::pool::WorkerPool;
use crate::worker::{EndpointWorker, UpstreamReply};

/// Upper bound on one hold-the-connection sleep, so newly recovered workers
/// are noticed promptly even when no recovery time is known.
const MAX_HOLD: Duration = Duration::from_secs(5);

/// Routes client requests across the pool with failover semantics.
pub struct RequestRouter {
    pool: Arc<WorkerPool>,
}

impl RequestRouter {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    /// Dispatch one request, blocking until an upstream produces a terminal
    /// response or every upstream is exhausted under the retry policy.
    pub async fn route(&self, method: &str, body: Bytes) -> Result<UpstreamReply> {
        let max_attempts = self.pool.all().len() * 2;
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0usize;
        let mut last_error = String::from("no endpoint attempted");

        loop {
            let available = self.pool.available();
            if available.is_empty() {
                let recovery = self.pool.shortest_recovery();
                let hold = if recovery.is_zero() { MAX_HOLD } else { recovery.min(MAX_HOLD) };
                debug!(method, hold_ms = hold.as_millis() as u64, "no endpoint available, holding connection");
                tokio::time::sleep(hold).await;
                continue;
            }

            let untried: Vec<&EndpointWorker> =
                available.iter().filter(|w| !tried.contains(w.url())).collect();
            let candidates: Vec<&EndpointWorker> = if untried.is_empty() {
                available.iter().collect()
            } else {
                untried
            };
            let queue_lengths: Vec<usize> =
                candidates.iter().map(|w| w.queue_length()).collect();
            let worker = candidates[least_loaded(&queue_lengths)];

            attempts += 1;
            let outcome = match worker.enqueue(method, body.clone()) {
                Ok(rx) => match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(ProxyError::WorkerUnavailable("worker stopped".into())),
                },
                Err(err) => Err(err),
            };

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    debug!(method, url = %worker.url(), attempts, error = %err, "endpoint failed, considering failover");
                    tried.insert(worker.url().to_string());
                    last_error = err.to_string();

                    let available_now = self.pool.available().len();
                    if tried.len() >= available_now {
                        if attempts >= max_attempts {
                            warn!(method, attempts, last_error = %last_error, "retry budget exhausted");
                            return Err(ProxyError::AllEndpointsFailed(last_error));
                        }
                        // give exhausted endpoints a second chance within
                        // this request
                        tried.clear();
                    }
                }
            }
        }
    }
}

/// Index of the smallest queue; the first minimum wins, which is what makes
/// ties resolve in configuration order.
fn least_loaded(queue_lengths: &[usize]) -> usize {
    let mut best = 0;
    for (i, len) in queue_lengths.iter().enumerate().skip(1) {
        if *len < queue_lengths[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded_picks_minimum() {
        assert_eq!(least_loaded(&[3, 1, 2]), 1);
        assert_eq!(least_loaded(&[5, 4, 0]), 2);
    }

    #[test]
    fn test_least_loaded_ties_resolve_in_order() {
        assert_eq!(least_loaded(&[2, 2, 2]), 0);
        assert_eq!(least_loaded(&[4, 1, 1]), 1);
    }

    #[test]
    fn test_least_loaded_single() {
        assert_eq!(least_loaded(&[7]), 0);
    }
}
