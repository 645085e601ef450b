//! JSON-RPC 2.0 envelope types.
//!
//! The proxy forwards request and response bodies untouched, so these types
//! exist for the places where an envelope has to be *produced* (ingress
//! validation failures, the all-endpoints-failed error, health probes) or
//! *inspected* (the `error` object of an upstream response). They follow the
//! JSON-RPC 2.0 specification:
//!
//! - Request: `{"jsonrpc": "2.0", "method": "...", "params": ..., "id": ...}`
//! - Response: `{"jsonrpc": "2.0", "result": ..., "error": ..., "id": ...}`
//! - Error: `{"code": ..., "message": "...", "data": ...}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request.
///
/// `params` and `id` are optional on the wire; `jsonrpc` and `method` are
/// mandatory and enforced by [`validate_envelope`] at the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Name of the method to invoke
    pub method: String,
    /// Parameter values (array or object; omitted when absent)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Request identifier (number, string, or null)
    #[serde(default)]
    pub id: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Result value on success (None if error is present)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object on failure (None if result is present)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Request identifier (must match the request id)
    pub id: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code (standard codes are negative integers)
    pub code: i64,
    /// Short description of the error
    pub message: String,
    /// Additional data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Invalid JSON was received by the server
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i64 = -32603;

impl JsonRpcRequest {
    /// Create a request with a numeric id.
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

impl JsonRpcError {
    /// Create an invalid request error (-32600)
    pub fn invalid_request(msg: &str) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: msg.into(),
            data: None,
        }
    }

    /// Create an internal error (-32603)
    pub fn internal_error(msg: &str) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: msg.into(),
            data: None,
        }
    }
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Validate a raw ingress body as a JSON-RPC request envelope.
///
/// The proxy never re-serializes the client payload, so validation operates
/// on the parsed [`Value`] rather than a typed struct: `jsonrpc` and
/// `method` must be present as strings. Returns the method name (borrowed
/// from the value) and the request id for error correlation.
pub fn validate_envelope(body: &Value) -> Result<(&str, Value), &'static str> {
    let obj = body.as_object().ok_or("request body is not a JSON object")?;
    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(_) => {}
        None => return Err("missing jsonrpc field"),
    }
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or("missing method field")?;
    let id = obj.get("id").cloned().unwrap_or(Value::Null);
    Ok((method, id))
}
