//! Health probing for workers stuck in the ERROR state.
//!
//! Cooldowns recover on their own timers; the probe path exists for workers
//! that were failed out of rotation by consecutive transport failures and
//! therefore have no schedule. Probes bypass the worker queue entirely so a
//! backlog of user traffic can never deadlock recovery.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::worker::{EndpointWorker, WorkerState};

/// Interval prober over the pool's roster. Only ERROR-state workers are
/// probed; COOLING_DOWN workers are left to their timers.
pub struct HealthProber {
    workers: Vec<EndpointWorker>,
    interval: Duration,
    http: reqwest::Client,
}

impl HealthProber {
    pub fn new(
        workers: Vec<EndpointWorker>,
        interval: Duration,
        timeout: Duration,
    ) -> evmrelay_common::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| evmrelay_common::ProxyError::Transport(e.to_string()))?;
        Ok(Self {
            workers,
            interval,
            http,
        })
    }

    /// Run the probe loop in the background until shutdown.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick of a tokio interval fires immediately; skip it so
        // freshly-started proxies don't probe healthy endpoints
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("health prober shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_errored().await;
                }
            }
        }
    }

    async fn probe_errored(&self) {
        for worker in &self.workers {
            if worker.state() != WorkerState::Error {
                continue;
            }
            match self.probe(worker.url()).await {
                Ok(true) => worker.mark_recovered(),
                Ok(false) => {
                    debug!(url = %worker.url(), "health probe got an empty result, endpoint still down");
                }
                Err(err) => {
                    warn!(url = %worker.url(), error = %err, "health probe failed");
                }
            }
        }
    }

    /// One probe call, off the worker queue. Healthy means a body carrying a
    /// non-empty `result`.
    async fn probe(&self, url: &str) -> Result<bool, reqwest::Error> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "eth_blockNumber",
            "params": [],
            "id": 1,
        });
        let response = self.http.post(url).json(&body).send().await?;
        let payload: Value = response.json().await?;
        Ok(has_result(&payload))
    }
}

fn has_result(payload: &Value) -> bool {
    match payload.get("result") {
        None => false,
        Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}
