//! # evmrelay entry point
//!
//! Failover reverse proxy for Ethereum-compatible JSON-RPC endpoints.
//!
//! ## Usage
//!
//! ```bash
//! # Run from a config file
//! evmrelay -c evmrelay.json
//!
//! # Run against two endpoints with everything else at defaults
//! evmrelay -e https://rpc.example.org -e https://backup.example.org
//!
//! # Override the bind address and database location
//! evmrelay -c evmrelay.json -b 127.0.0.1:9545 --db /var/lib/evmrelay/stats.db
//! ```
//!
//! Logging defaults to `info` and follows `RUST_LOG` when set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;

use evmrelay_common::Config;
use evmrelay_proxy::{HttpServer, RateLimitDetector, RequestRouter, WorkerPool};
use evmrelay_store::StatsStore;

/// How long workers get to finish queued requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// evmrelay - failover reverse proxy for Ethereum JSON-RPC endpoints
#[derive(FromArgs)]
struct Cli {
    /// path to the JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// ingress bind address (host:port), overriding the config file
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// upstream endpoint URL; repeatable, replaces the config file list
    ///
    /// Must include the http:// or https:// prefix.
    #[argh(option, short = 'e', long = "endpoint")]
    endpoints: Vec<String>,

    /// statistics database path, overriding the config file
    #[argh(option, long = "db")]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default log level is INFO; RUST_LOG overrides.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = resolve_config(&cli)?;
    tracing::info!(
        endpoints = config.endpoints.len(),
        database = %config.database.path,
        "starting evmrelay"
    );

    let store = Arc::new(
        StatsStore::open(&config.database.path, config.rate_limit.history_window_size)
            .with_context(|| format!("opening statistics database at {}", config.database.path))?,
    );
    let detector = Arc::new(RateLimitDetector::new(config.rate_limit.clone(), store.clone()));
    let pool = Arc::new(WorkerPool::new(&config, store.clone(), detector)?);
    let prober = pool.start_health_prober(&config)?;
    let router = RequestRouter::new(pool.clone());
    let server = HttpServer::new(router, pool.clone(), store.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!("invalid bind address {}:{}", config.server.host, config.server.port)
        })?;

    server.run(addr, shutdown_signal()).await?;

    // The ingress has stopped accepting traffic; wind down the rest.
    tracing::info!("shutting down, draining worker queues");
    let drained = pool.shutdown(SHUTDOWN_GRACE).await;
    prober.abort();
    if let Err(err) = store.flush() {
        tracing::warn!(%err, "failed to flush statistics database");
    }
    if !drained {
        anyhow::bail!("worker queues did not drain within the shutdown grace period");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Merge the config file (or defaults) with CLI overrides, then validate.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            Config::from_file(path).with_context(|| format!("loading config file {path}"))?
        }
        None => Config::default(),
    };
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }
    if let Some(bind) = &cli.bind {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?;
        config.server.host = addr.ip().to_string();
        config.server.port = addr.port();
    }
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
