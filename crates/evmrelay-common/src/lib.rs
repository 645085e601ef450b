//! evmrelay Common Types
//!
//! Shared building blocks for the evmrelay proxy: the JSON-RPC 2.0 envelope
//! types used on both the ingress and egress sides, the error taxonomy that
//! the router and workers exchange, and the configuration model.
//!
//! # Overview
//!
//! evmrelay is a failover reverse proxy for Ethereum-compatible JSON-RPC
//! endpoints. This crate contains everything the other components agree on:
//!
//! - **Protocol layer**: [`protocol`] — request/response/error envelopes and
//!   the standard JSON-RPC 2.0 error codes
//! - **Error taxonomy**: [`error`] — the tagged outcome variants that drive
//!   failover decisions (`TransientUpstream`, `QueueFull`, ...)
//! - **Configuration**: [`config`] — the full option tree with defaults,
//!   JSON file loading, and validation
//!
//! The proxy is content-agnostic: payloads pass through byte-for-byte and
//! only the `method` field (logging) and `error.{code,message}` fields
//! (classification) are ever inspected.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
