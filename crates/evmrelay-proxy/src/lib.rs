//! evmrelay Dispatch Engine
//!
//! This crate is the core of the proxy: it decides which upstream endpoint
//! serves each client request and how the roster recovers from rate limits
//! and transient failures.
//!
//! # Architecture
//!
//! ```text
//! client → HttpServer → RequestRouter → WorkerPool::available
//!            │                              │
//!            │                     EndpointWorker::enqueue
//!            │                              │ (serialized per endpoint)
//!            │                      upstream HTTP POST
//!            │                              │
//!            │                      RateLimitDetector
//!            │                              │
//!            └── response ◄── resolve / re-queue / fail over
//! ```
//!
//! - **Parallel across endpoints, serial within each**: every endpoint is
//!   owned by exactly one [`worker::EndpointWorker`] draining a FIFO queue,
//!   so at most one upstream request is ever in flight per endpoint.
//!   Hammering a single endpoint in parallel provokes the very rate limits
//!   this proxy exists to absorb.
//! - **Local recovery first**: a rate-limited worker re-queues the head item
//!   and cools down; the router only fails over on transient outcomes, and
//!   holds the client connection instead of erroring while every endpoint is
//!   recovering.
//! - **Detection feeds persistence feeds detection**: outcomes recorded in
//!   the [`evmrelay_store::StatsStore`] drive the failure-rate signal and
//!   the historical cooldown floor of the [`detector::RateLimitDetector`].

pub mod detector;
pub mod health;
pub mod http_server;
pub mod pool;
pub mod router;
pub mod worker;

pub use detector::{DetectionInput, RateLimitDetector, Signal, TransportFailure, Verdict};
pub use health::HealthProber;
pub use http_server::HttpServer;
pub use pool::WorkerPool;
pub use router::RequestRouter;
pub use worker::{EndpointWorker, UpstreamReply, WorkerState, WorkerStatus};
