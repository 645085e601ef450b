//! Multi-signal rate-limit detection and adaptive cooldown.
//!
//! The detector is stateless per call apart from one per-endpoint counter:
//! the consecutive-strike count that drives exponential backoff. Four
//! independent signals are evaluated and OR-ed; any single positive signal
//! yields a rate-limit verdict, and confidence is simply the fraction of
//! signals that fired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use evmrelay_common::config::RateLimitConfig;
use evmrelay_store::StatsStore;

/// Vocabulary matched (as substrings, lowercased) against response bodies
/// and transport error messages.
const RATE_LIMIT_KEYWORDS: &[&str] = &[
    "rate limit",
    "too many requests",
    "exceeded",
    "quota",
    "throttle",
    "too many",
];

/// HTTP statuses treated as rate-limit responses. 403 is included for
/// providers that mask throttling behind forbidden responses, although it
/// can also mean auth misconfiguration; detections on it are logged loudly.
const RATE_LIMIT_STATUSES: &[u16] = &[429, 503, 403];

/// Minimum sample size before the failure-rate signal is trusted.
const FAILURE_RATE_MIN_SAMPLES: usize = 5;

/// How far back the historical-cooldown floor looks.
const HISTORY_DAYS: i64 = 7;

/// A transport-level failure, pre-digested from the HTTP client error so the
/// detector stays independent of the egress stack.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub message: String,
    /// The client classified this as a timeout (connect or read deadline).
    pub timed_out: bool,
}

impl TransportFailure {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        Self {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

/// Everything known about one upstream exchange, handed to [`detect`].
#[derive(Debug, Default)]
pub struct DetectionInput<'a> {
    pub http_status: Option<u16>,
    /// Parsed response body, when the body was valid JSON.
    pub body: Option<&'a Value>,
    pub transport_error: Option<&'a TransportFailure>,
    /// Parsed `Retry-After` header, when present.
    pub retry_after: Option<Duration>,
    pub response_time: Duration,
}

/// Which signals fired for a positive verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Signal {
    /// HTTP status in the rate-limit set.
    HttpStatus(u16),
    /// A vocabulary keyword found in the body or transport error text.
    BodyKeyword(&'static str),
    /// Recent failure fraction at or above the detection threshold.
    FailureRate(f64),
    /// The transport reported a timeout.
    TransportTimeout,
}

/// Outcome of a detection pass.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub rate_limited: bool,
    /// Recommended cooldown; zero when not rate-limited.
    pub cooldown: Duration,
    /// Fraction of signals positive: 0.25, 0.50, 0.75, or 1.00.
    pub confidence: f64,
    pub signals: Vec<Signal>,
}

impl Verdict {
    fn negative() -> Self {
        Self {
            rate_limited: false,
            cooldown: Duration::ZERO,
            confidence: 0.0,
            signals: Vec::new(),
        }
    }
}

/// Layered rate-limit detector with per-endpoint strike counters.
pub struct RateLimitDetector {
    cfg: RateLimitConfig,
    store: Arc<StatsStore>,
    strikes: Mutex<HashMap<i64, u32>>,
}

impl RateLimitDetector {
    pub fn new(cfg: RateLimitConfig, store: Arc<StatsStore>) -> Self {
        Self {
            cfg,
            store,
            strikes: Mutex::new(HashMap::new()),
        }
    }

    /// Analyze one upstream exchange.
    ///
    /// A negative verdict resets the endpoint's strike counter; a positive
    /// one chooses a cooldown (Retry-After → exponential backoff →
    /// historical floor, in that precedence) and then counts the strike.
    pub fn detect(&self, endpoint_id: i64, input: &DetectionInput<'_>) -> Verdict {
        let mut signals = Vec::new();

        if let Some(status) = input.http_status {
            if RATE_LIMIT_STATUSES.contains(&status) {
                if status == 403 {
                    warn!(
                        endpoint_id,
                        "403 counted as a rate-limit signal; verify upstream credentials if this repeats"
                    );
                }
                signals.push(Signal::HttpStatus(status));
            }
        }

        let haystack = Self::haystack(input);
        if let Some(keyword) = RATE_LIMIT_KEYWORDS.iter().copied().find(|k| haystack.contains(k)) {
            signals.push(Signal::BodyKeyword(keyword));
        }

        let outcomes = self.store.recent_outcomes(endpoint_id);
        if outcomes.len() >= FAILURE_RATE_MIN_SAMPLES {
            let failed = outcomes.iter().filter(|ok| !**ok).count();
            let rate = failed as f64 / outcomes.len() as f64;
            if rate >= self.cfg.detection_threshold {
                signals.push(Signal::FailureRate(rate));
            }
        }

        if let Some(failure) = input.transport_error {
            if failure.timed_out || failure.message.to_lowercase().contains("timeout") {
                signals.push(Signal::TransportTimeout);
            }
        }

        if signals.is_empty() {
            self.reset_strikes(endpoint_id);
            return Verdict::negative();
        }

        let cooldown = self.choose_cooldown(endpoint_id, input.retry_after);
        self.count_strike(endpoint_id);

        let confidence = signals.len() as f64 / 4.0;
        debug!(
            endpoint_id,
            cooldown_ms = cooldown.as_millis() as u64,
            confidence,
            ?signals,
            "rate limit detected"
        );
        Verdict {
            rate_limited: true,
            cooldown,
            confidence,
            signals,
        }
    }

    /// Forget the endpoint's strike streak. Called on non-rate-limited
    /// verdicts, cooldown expiry, and health-probe recovery.
    pub fn reset_strikes(&self, endpoint_id: i64) {
        self.strikes.lock().expect("strike map lock poisoned").remove(&endpoint_id);
    }

    fn count_strike(&self, endpoint_id: i64) {
        *self
            .strikes
            .lock()
            .expect("strike map lock poisoned")
            .entry(endpoint_id)
            .or_insert(0) += 1;
    }

    fn strike_count(&self, endpoint_id: i64) -> u32 {
        self.strikes
            .lock()
            .expect("strike map lock poisoned")
            .get(&endpoint_id)
            .copied()
            .unwrap_or(0)
    }

    /// Cooldown precedence: an explicit `Retry-After` wins outright (clamped
    /// to the maximum only); otherwise exponential backoff from the strike
    /// count, floored by the endpoint's 7-day historical average when that
    /// is larger.
    fn choose_cooldown(&self, endpoint_id: i64, retry_after: Option<Duration>) -> Duration {
        let max = self.cfg.max_cooldown_ms;
        if let Some(retry_after) = retry_after {
            let ms = (retry_after.as_millis() as u64).min(max);
            return Duration::from_millis(ms);
        }

        let strikes = self.strike_count(endpoint_id);
        let backoff = (self.cfg.min_cooldown_ms as f64
            * self.cfg.backoff_multiplier.powi(strikes as i32))
        .round() as u64;
        let mut chosen = backoff.clamp(self.cfg.min_cooldown_ms, max);

        match self.store.average_cooldown(endpoint_id, HISTORY_DAYS) {
            Ok(Some(historical)) if historical > chosen => {
                chosen = historical.min(max);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(endpoint_id, %err, "historical cooldown lookup failed; using backoff value");
            }
        }
        Duration::from_millis(chosen)
    }

    /// Lowercased concatenation of the body text (string body, or the whole
    /// serialized body, which subsumes `error.message`) and the transport
    /// error message.
    fn haystack(input: &DetectionInput<'_>) -> String {
        let mut text = String::new();
        match input.body {
            Some(Value::String(s)) => text.push_str(s),
            Some(other) => text.push_str(&other.to_string()),
            None => {}
        }
        if let Some(failure) = input.transport_error {
            text.push(' ');
            text.push_str(&failure.message);
        }
        text.to_lowercase()
    }
}

/// Parse a `Retry-After` header value: integer seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
