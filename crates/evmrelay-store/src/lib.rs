//! SQLite-backed per-endpoint statistics for evmrelay.
//!
//! The store is the single shared mutator in the system: worker drain loops
//! record request outcomes and rate-limit events, the detector reads recent
//! outcomes and historical cooldowns, and the `/stats` endpoint reads the
//! aggregate rows. All SQLite access is serialized behind one connection.
//!
//! Two design points matter for the hot path:
//!
//! - The failure-rate signal never reads SQLite. A bounded in-memory ring of
//!   recent outcomes per endpoint answers it; the database is written, not
//!   queried, per request.
//! - Durability is bounded-loss rather than synchronous: WAL journal mode
//!   with `synchronous=NORMAL` keeps writes cheap while confining crash loss
//!   to the tail of the log.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};

use evmrelay_common::error::{ProxyError, Result};

pub mod models;

pub use models::{Endpoint, EndpointStatistics, RateLimitEvent, RequestLogEntry};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS endpoints (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    url         TEXT NOT NULL UNIQUE,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS endpoint_statistics (
    endpoint_id            INTEGER PRIMARY KEY REFERENCES endpoints(id),
    total_requests         INTEGER NOT NULL DEFAULT 0,
    successful_requests    INTEGER NOT NULL DEFAULT 0,
    failed_requests        INTEGER NOT NULL DEFAULT 0,
    rate_limited_requests  INTEGER NOT NULL DEFAULT 0,
    total_response_time_ms INTEGER NOT NULL DEFAULT 0,
    avg_response_time_ms   REAL NOT NULL DEFAULT 0,
    last_request_at        INTEGER
);

CREATE TABLE IF NOT EXISTS rate_limit_events (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id          INTEGER NOT NULL REFERENCES endpoints(id),
    detected_at          INTEGER NOT NULL,
    recovery_at          INTEGER NOT NULL,
    cooldown_duration_ms INTEGER NOT NULL,
    http_status          INTEGER,
    message              TEXT
);

CREATE INDEX IF NOT EXISTS idx_rate_limit_events_endpoint
    ON rate_limit_events (endpoint_id, detected_at DESC);

CREATE TABLE IF NOT EXISTS request_log (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id      INTEGER NOT NULL REFERENCES endpoints(id),
    method           TEXT NOT NULL,
    success          INTEGER NOT NULL,
    response_time_ms INTEGER NOT NULL,
    http_status      INTEGER,
    error_message    TEXT,
    created_at       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_request_log_endpoint_time
    ON request_log (endpoint_id, created_at DESC);
";

/// Persistent record of endpoints, aggregate counters, rate-limit events,
/// and a recent-outcome ring feeding the detector's failure-rate signal.
pub struct StatsStore {
    conn: Mutex<Connection>,
    /// Most recent request outcomes per endpoint, newest at the back.
    recent: Mutex<HashMap<i64, VecDeque<bool>>>,
    window: usize,
}

impl StatsStore {
    /// Open (or create) the statistics database at `path`.
    ///
    /// The parent directory is created if missing. `window` bounds the
    /// in-memory recent-outcome ring per endpoint.
    pub fn open(path: impl AsRef<Path>, window: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::with_connection(conn, window)
    }

    /// In-memory database, for tests and ephemeral runs.
    pub fn open_in_memory(window: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn, window)
    }

    fn with_connection(conn: Connection, window: usize) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").map_err(storage_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(storage_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            recent: Mutex::new(HashMap::new()),
            window: window.max(1),
        })
    }

    /// Idempotent upsert of an endpoint by URL; returns its id.
    ///
    /// On first sighting the matching `endpoint_statistics` row is created
    /// alongside. Re-sighting an endpoint re-activates it and refreshes
    /// `updated_at`; rows are never deleted.
    pub fn ensure_endpoint(&self, url: &str) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("stats store lock poisoned");
        conn.execute(
            "INSERT INTO endpoints (url, is_active, created_at, updated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(url) DO UPDATE SET is_active = 1, updated_at = ?2",
            params![url, now],
        )
        .map_err(storage_err)?;
        let id: i64 = conn
            .query_row("SELECT id FROM endpoints WHERE url = ?1", params![url], |row| {
                row.get(0)
            })
            .map_err(storage_err)?;
        conn.execute(
            "INSERT OR IGNORE INTO endpoint_statistics (endpoint_id) VALUES (?1)",
            params![id],
        )
        .map_err(storage_err)?;
        Ok(id)
    }

    /// Record one upstream call: append a log row and recompute the
    /// aggregates in the same transaction.
    pub fn record_request(
        &self,
        endpoint_id: i64,
        method: &str,
        success: bool,
        response_time_ms: u64,
        http_status: Option<u16>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        {
            let mut conn = self.conn.lock().expect("stats store lock poisoned");
            let tx = conn.transaction().map_err(storage_err)?;
            tx.execute(
                "INSERT INTO request_log
                     (endpoint_id, method, success, response_time_ms, http_status, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    endpoint_id,
                    method,
                    success,
                    response_time_ms as i64,
                    http_status,
                    error_message,
                    now
                ],
            )
            .map_err(storage_err)?;
            tx.execute(
                "UPDATE endpoint_statistics SET
                     total_requests         = total_requests + 1,
                     successful_requests    = successful_requests + ?2,
                     failed_requests        = failed_requests + ?3,
                     total_response_time_ms = total_response_time_ms + ?4,
                     avg_response_time_ms   = CAST(total_response_time_ms + ?4 AS REAL)
                                                  / (total_requests + 1),
                     last_request_at        = ?5
                 WHERE endpoint_id = ?1",
                params![
                    endpoint_id,
                    success as i64,
                    (!success) as i64,
                    response_time_ms as i64,
                    now
                ],
            )
            .map_err(storage_err)?;
            tx.commit().map_err(storage_err)?;
        }

        let mut recent = self.recent.lock().expect("recent ring lock poisoned");
        let ring = recent.entry(endpoint_id).or_default();
        ring.push_back(success);
        while ring.len() > self.window {
            ring.pop_front();
        }
        Ok(())
    }

    /// Record one rate-limit detection: append the event and increment the
    /// endpoint's `rate_limited_requests` counter.
    pub fn record_rate_limit_event(
        &self,
        endpoint_id: i64,
        cooldown_ms: u64,
        http_status: Option<u16>,
        message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.lock().expect("stats store lock poisoned");
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute(
            "INSERT INTO rate_limit_events
                 (endpoint_id, detected_at, recovery_at, cooldown_duration_ms, http_status, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                endpoint_id,
                now,
                now + cooldown_ms as i64,
                cooldown_ms as i64,
                http_status,
                message
            ],
        )
        .map_err(storage_err)?;
        tx.execute(
            "UPDATE endpoint_statistics
             SET rate_limited_requests = rate_limited_requests + 1
             WHERE endpoint_id = ?1",
            params![endpoint_id],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)
    }

    /// The most recent `limit` request-log rows for an endpoint, oldest
    /// first.
    pub fn recent_requests(&self, endpoint_id: i64, limit: usize) -> Result<Vec<RequestLogEntry>> {
        let conn = self.conn.lock().expect("stats store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, endpoint_id, method, success, response_time_ms,
                        http_status, error_message, created_at
                 FROM request_log
                 WHERE endpoint_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![endpoint_id, limit as i64], |row| {
                Ok(RequestLogEntry {
                    id: row.get(0)?,
                    endpoint_id: row.get(1)?,
                    method: row.get(2)?,
                    success: row.get(3)?,
                    response_time_ms: row.get::<_, i64>(4)? as u64,
                    http_status: row.get(5)?,
                    error_message: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .map_err(storage_err)?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry.map_err(storage_err)?);
        }
        entries.reverse();
        Ok(entries)
    }

    /// Recent request outcomes for an endpoint from the in-memory ring,
    /// oldest first. Empty until the first recorded request after startup.
    pub fn recent_outcomes(&self, endpoint_id: i64) -> Vec<bool> {
        let recent = self.recent.lock().expect("recent ring lock poisoned");
        recent
            .get(&endpoint_id)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Average cooldown chosen for this endpoint over the trailing `days`
    /// window, or `None` if no events fall inside it.
    pub fn average_cooldown(&self, endpoint_id: i64, days: i64) -> Result<Option<u64>> {
        let cutoff = Utc::now().timestamp_millis() - days * 24 * 60 * 60 * 1000;
        let conn = self.conn.lock().expect("stats store lock poisoned");
        let avg: Option<f64> = conn
            .query_row(
                "SELECT AVG(cooldown_duration_ms) FROM rate_limit_events
                 WHERE endpoint_id = ?1 AND detected_at >= ?2",
                params![endpoint_id, cutoff],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(avg.map(|ms| ms.round() as u64))
    }

    /// Aggregate rows for every known endpoint, for read-only reporting.
    pub fn endpoint_statistics(&self) -> Result<Vec<EndpointStatistics>> {
        let conn = self.conn.lock().expect("stats store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT s.endpoint_id, e.url, s.total_requests, s.successful_requests,
                        s.failed_requests, s.rate_limited_requests,
                        s.total_response_time_ms, s.avg_response_time_ms, s.last_request_at
                 FROM endpoint_statistics s
                 JOIN endpoints e ON e.id = s.endpoint_id
                 ORDER BY s.endpoint_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EndpointStatistics {
                    endpoint_id: row.get(0)?,
                    url: row.get(1)?,
                    total_requests: row.get::<_, i64>(2)? as u64,
                    successful_requests: row.get::<_, i64>(3)? as u64,
                    failed_requests: row.get::<_, i64>(4)? as u64,
                    rate_limited_requests: row.get::<_, i64>(5)? as u64,
                    total_response_time_ms: row.get::<_, i64>(6)? as u64,
                    avg_response_time_ms: row.get(7)?,
                    last_request_at: row.get(8)?,
                })
            })
            .map_err(storage_err)?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row.map_err(storage_err)?);
        }
        Ok(stats)
    }

    /// Flush the WAL into the main database file. Called on shutdown so a
    /// subsequent reader sees everything without replaying the log.
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().expect("stats store lock poisoned");
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(storage_err)
    }
}

fn storage_err(err: rusqlite::Error) -> ProxyError {
    ProxyError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StatsStore {
        StatsStore::open_in_memory(20).unwrap()
    }

    #[test]
    fn test_ensure_endpoint_idempotent() {
        let store = store();
        let a = store.ensure_endpoint("https://rpc-a.example.org").unwrap();
        let b = store.ensure_endpoint("https://rpc-b.example.org").unwrap();
        let a_again = store.ensure_endpoint("https://rpc-a.example.org").unwrap();
        assert_eq!(a, a_again);
        assert_ne!(a, b);

        // the statistics row exists from the start
        let stats = store.endpoint_statistics().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].total_requests, 0);
    }

    #[test]
    fn test_record_request_updates_aggregates() {
        let store = store();
        let id = store.ensure_endpoint("https://rpc.example.org").unwrap();
        store.record_request(id, "eth_chainId", true, 120, Some(200), None).unwrap();
        store.record_request(id, "eth_blockNumber", true, 80, Some(200), None).unwrap();
        store
            .record_request(id, "eth_call", false, 40, Some(500), Some("boom"))
            .unwrap();

        let stats = &store.endpoint_statistics().unwrap()[0];
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.total_requests, stats.successful_requests + stats.failed_requests);
        assert_eq!(stats.total_response_time_ms, 240);
        assert!((stats.avg_response_time_ms - 80.0).abs() < f64::EPSILON);
        assert!(stats.last_request_at.is_some());
    }

    #[test]
    fn test_recent_requests_chronological() {
        let store = store();
        let id = store.ensure_endpoint("https://rpc.example.org").unwrap();
        for i in 0..5 {
            store
                .record_request(id, &format!("method_{i}"), true, 10, Some(200), None)
                .unwrap();
        }
        let entries = store.recent_requests(id, 3).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].method, "method_2");
        assert_eq!(entries[2].method, "method_4");
    }

    #[test]
    fn test_recent_outcomes_ring_bounded() {
        let store = StatsStore::open_in_memory(4).unwrap();
        let id = store.ensure_endpoint("https://rpc.example.org").unwrap();
        assert!(store.recent_outcomes(id).is_empty());
        for i in 0..6 {
            store
                .record_request(id, "eth_call", i % 2 == 0, 10, Some(200), None)
                .unwrap();
        }
        let outcomes = store.recent_outcomes(id);
        assert_eq!(outcomes.len(), 4);
        // outcomes for i = 2..6, oldest first
        assert_eq!(outcomes, vec![true, false, true, false]);
    }

    #[test]
    fn test_rate_limit_event_increments_counter() {
        let store = store();
        let id = store.ensure_endpoint("https://rpc.example.org").unwrap();
        store.record_rate_limit_event(id, 2000, Some(429), Some("Too Many Requests")).unwrap();

        let stats = &store.endpoint_statistics().unwrap()[0];
        assert_eq!(stats.rate_limited_requests, 1);
        // the event does not count as a completed request
        assert_eq!(stats.total_requests, 0);
    }

    #[test]
    fn test_average_cooldown_window() {
        let store = store();
        let id = store.ensure_endpoint("https://rpc.example.org").unwrap();
        assert_eq!(store.average_cooldown(id, 7).unwrap(), None);

        store.record_rate_limit_event(id, 60_000, Some(429), None).unwrap();
        store.record_rate_limit_event(id, 120_000, Some(503), None).unwrap();
        assert_eq!(store.average_cooldown(id, 7).unwrap(), Some(90_000));

        // a different endpoint is unaffected
        let other = store.ensure_endpoint("https://other.example.org").unwrap();
        assert_eq!(store.average_cooldown(other, 7).unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statistics.db");
        let id = {
            let store = StatsStore::open(&path, 20).unwrap();
            let id = store.ensure_endpoint("https://rpc.example.org").unwrap();
            store.record_request(id, "eth_chainId", true, 50, Some(200), None).unwrap();
            store.flush().unwrap();
            id
        };
        let store = StatsStore::open(&path, 20).unwrap();
        let stats = store.endpoint_statistics().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].endpoint_id, id);
        assert_eq!(stats[0].total_requests, 1);
        // the in-memory ring does not survive a restart
        assert!(store.recent_outcomes(id).is_empty());
    }
}
