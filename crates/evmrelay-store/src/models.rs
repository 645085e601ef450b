//! Row types read back from the statistics database.

use serde::Serialize;

/// A configured upstream endpoint. Created on first configuration sighting,
/// never deleted; `is_active` tracks whether the current config names it.
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: i64,
    pub url: String,
    pub is_active: bool,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
}

/// Aggregate counters, one row per endpoint, updated in place.
///
/// Invariants: `total_requests = successful_requests + failed_requests`;
/// `avg_response_time_ms = total_response_time_ms / total_requests` whenever
/// `total_requests > 0`.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatistics {
    pub endpoint_id: i64,
    pub url: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub total_response_time_ms: u64,
    pub avg_response_time_ms: f64,
    /// Unix milliseconds of the most recent recorded request, if any.
    pub last_request_at: Option<i64>,
}

/// One rate-limit detection, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitEvent {
    pub id: i64,
    pub endpoint_id: i64,
    /// Unix milliseconds.
    pub detected_at: i64,
    /// Projected recovery timestamp, unix milliseconds.
    pub recovery_at: i64,
    pub cooldown_duration_ms: u64,
    pub http_status: Option<u16>,
    pub message: Option<String>,
}

/// One upstream call, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub id: i64,
    pub endpoint_id: i64,
    pub method: String,
    pub success: bool,
    pub response_time_ms: u64,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
    /// Unix milliseconds.
    pub created_at: i64,
}
