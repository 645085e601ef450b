//! Ownership of the worker roster.
//!
//! The pool is built once from the configured endpoint list and never
//! changes shape afterwards: endpoints are registered in the statistics
//! store, each gets a worker whose drain loop is spawned immediately, and
//! the config order is preserved for the router's tie-breaking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use evmrelay_common::config::Config;
use evmrelay_common::error::Result;
use evmrelay_store::StatsStore;

use crate::detector::RateLimitDetector;
use crate::health::HealthProber;
use crate::worker::{EndpointWorker, WorkerStatus};

/// Owns every [`EndpointWorker`] plus the shutdown signal their drain loops
/// listen on.
pub struct WorkerPool {
    workers: Vec<EndpointWorker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    drain_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Build the roster and start one drain loop per endpoint.
    pub fn new(
        config: &Config,
        store: Arc<StatsStore>,
        detector: Arc<RateLimitDetector>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.worker.request_timeout())
            .build()
            .map_err(|e| evmrelay_common::ProxyError::Transport(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(config.endpoints.len());
        let mut drain_handles = Vec::with_capacity(config.endpoints.len());
        for url in &config.endpoints {
            let endpoint_id = store.ensure_endpoint(url)?;
            let worker = EndpointWorker::new(
                endpoint_id,
                url.clone(),
                config.worker.clone(),
                http.clone(),
                detector.clone(),
                store.clone(),
            );
            drain_handles.push(tokio::spawn(worker.clone().run(shutdown_rx.clone())));
            workers.push(worker);
        }
        info!(endpoints = workers.len(), "worker pool started");
        Ok(Self {
            workers,
            shutdown_tx,
            shutdown_rx,
            drain_handles: std::sync::Mutex::new(drain_handles),
        })
    }

    /// Every worker, in configuration order.
    pub fn all(&self) -> &[EndpointWorker] {
        &self.workers
    }

    /// Workers currently accepting traffic, in configuration order.
    pub fn available(&self) -> Vec<EndpointWorker> {
        self.workers.iter().filter(|w| w.is_available()).cloned().collect()
    }

    /// Minimum positive recovery time across unavailable workers, or zero
    /// when nothing is recovering on a known schedule (ERROR-state workers
    /// have none).
    pub fn shortest_recovery(&self) -> Duration {
        self.workers
            .iter()
            .filter(|w| !w.is_available())
            .map(|w| w.recovery_time())
            .filter(|d| !d.is_zero())
            .min()
            .unwrap_or(Duration::ZERO)
    }

    /// Snapshot of every worker for `/stats`.
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(EndpointWorker::status).collect()
    }

    /// Start the background prober that rescues ERROR-state workers.
    pub fn start_health_prober(&self, config: &Config) -> Result<JoinHandle<()>> {
        let prober = HealthProber::new(
            self.workers.clone(),
            config.worker.health_check_interval(),
            config.worker.request_timeout(),
        )?;
        Ok(prober.spawn(self.shutdown_rx.clone()))
    }

    /// Signal shutdown and wait up to `grace` for the drain loops to finish
    /// their queues. Returns whether everything drained in time; loops that
    /// did not are aborted.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let mut handles: Vec<JoinHandle<()>> =
            self.drain_handles.lock().expect("drain handle lock poisoned").drain(..).collect();

        let deadline = tokio::time::Instant::now() + grace;
        let mut clean = true;
        for handle in handles.iter_mut() {
            match tokio::time::timeout_at(deadline, &mut *handle).await {
                Ok(_) => {}
                Err(_) => {
                    clean = false;
                    handle.abort();
                }
            }
        }
        if clean {
            info!("all worker queues drained");
        } else {
            warn!("shutdown grace period expired with work still queued");
        }
        clean
    }
}
