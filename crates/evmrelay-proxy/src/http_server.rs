//! HTTP ingress.
//!
//! A thin axum layer in front of the router: `POST /` carries JSON-RPC
//! traffic, `GET /health` answers load balancers, `GET /stats` exposes the
//! per-endpoint statistics. The ingress never re-serializes a successful
//! upstream body; whatever bytes the chosen endpoint returned are what the
//! client receives.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use evmrelay_common::error::{ProxyError, Result};
use evmrelay_common::protocol::jsonrpc::{validate_envelope, JsonRpcError, JsonRpcResponse, PARSE_ERROR};
use evmrelay_store::StatsStore;

use crate::pool::WorkerPool;
use crate::router::RequestRouter;

/// Shared state handed to every handler.
pub struct AppState {
    pub router: RequestRouter,
    pub pool: Arc<WorkerPool>,
    pub store: Arc<StatsStore>,
}

/// The ingress server.
pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(router: RequestRouter, pool: Arc<WorkerPool>, store: Arc<StatsStore>) -> Self {
        Self {
            state: Arc::new(AppState { router, pool, store }),
        }
    }

    /// Serve until the shutdown future resolves, then stop accepting new
    /// connections and let in-flight requests finish.
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = axum::Router::new()
            .route("/", post(handle_rpc))
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            .layer(CorsLayer::permissive())
            .with_state(self.state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("evmrelay listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ProxyError::Transport(format!("ingress server error: {e}")))?;
        Ok(())
    }
}

/// `POST /` — validate the envelope, route, and pass the winning upstream
/// body through untouched.
async fn handle_rpc(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return envelope_error(
                StatusCode::BAD_REQUEST,
                Value::Null,
                JsonRpcError {
                    code: PARSE_ERROR,
                    message: "Parse error".into(),
                    data: None,
                },
            );
        }
    };

    let (method, id) = match validate_envelope(&parsed) {
        Ok(parts) => parts,
        Err(reason) => {
            let id = parsed.get("id").cloned().unwrap_or(Value::Null);
            return envelope_error(
                StatusCode::BAD_REQUEST,
                id,
                JsonRpcError::invalid_request(reason),
            );
        }
    };

    match state.router.route(method, body).await {
        Ok(reply) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            reply.body,
        )
            .into_response(),
        Err(err) => {
            error!(method, %err, "request failed after exhausting endpoints");
            envelope_error(
                StatusCode::OK,
                id,
                JsonRpcError::internal_error(&format!("Internal error: {err}")),
            )
        }
    }
}

/// `GET /health` — 200 while at least one worker can take traffic.
async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let available = state.pool.available().len();
    let total = state.pool.all().len();
    let payload = json!({
        "status": if available > 0 { "ok" } else { "degraded" },
        "available_endpoints": available,
        "total_endpoints": total,
    });
    let status = if available > 0 { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(payload)).into_response()
}

/// `GET /stats` — persisted aggregates joined with live worker snapshots.
async fn handle_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.store.endpoint_statistics() {
        Ok(endpoints) => {
            let payload = json!({
                "endpoints": endpoints,
                "workers": state.pool.statuses(),
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(err) => {
            error!(%err, "failed to read endpoint statistics");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()})))
                .into_response()
        }
    }
}

fn envelope_error(status: StatusCode, id: Value, error: JsonRpcError) -> Response {
    (status, Json(JsonRpcResponse::error(id, error))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error_shape() {
        let response = envelope_error(
            StatusCode::BAD_REQUEST,
            Value::Null,
            JsonRpcError::invalid_request("missing method field"),
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_all_endpoints_failed_message_shape() {
        // the client-visible message embeds the router's terminal error
        let err = ProxyError::AllEndpointsFailed("connection refused".into());
        let rpc = JsonRpcError::internal_error(&format!("Internal error: {err}"));
        assert_eq!(rpc.code, -32603);
        assert_eq!(
            rpc.message,
            "Internal error: All RPC endpoints failed: connection refused"
        );
    }
}
