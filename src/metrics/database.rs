use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Coarse query classification used for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
    Other,
}

impl QueryKind {
    /// Classify by leading keyword: SELECT reads, INSERT/UPDATE/DELETE write
    pub fn classify(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("");
        if keyword.eq_ignore_ascii_case("select") {
            QueryKind::Read
        } else if ["insert", "update", "delete"]
            .iter()
            .any(|k| keyword.eq_ignore_ascii_case(k))
        {
            QueryKind::Write
        } else {
            QueryKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Read => "read",
            QueryKind::Write => "write",
            QueryKind::Other => "other",
        }
    }
}

/// Process-local service counters behind `DatabaseMetrics`
#[derive(Debug)]
pub struct QueryStats {
    total: AtomicU64,
    read: AtomicU64,
    write: AtomicU64,
    failed: AtomicU64,
    slow: AtomicU64,
    response_nanos: AtomicU64,
    connection_errors: AtomicU64,
    pool_exhausted: AtomicU64,
    failovers: AtomicU64,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Default for QueryStats {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            read: AtomicU64::new(0),
            write: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            slow: AtomicU64::new(0),
            response_nanos: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl QueryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self, kind: QueryKind, elapsed: Duration, failed: bool, slow_threshold: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match kind {
            QueryKind::Read => {
                self.read.fetch_add(1, Ordering::Relaxed);
            }
            QueryKind::Write => {
                self.write.fetch_add(1, Ordering::Relaxed);
            }
            QueryKind::Other => {}
        }
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if elapsed > slow_threshold {
            self.slow.fetch_add(1, Ordering::Relaxed);
        }
        self.response_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters; connection totals come from the pools
    pub fn snapshot(&self, active_connections: usize, idle_connections: usize) -> DatabaseMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let avg_response_time_ms = if total == 0 {
            0.0
        } else {
            self.response_nanos.load(Ordering::Relaxed) as f64 / total as f64 / 1_000_000.0
        };

        DatabaseMetrics {
            total_queries: total,
            read_queries: self.read.load(Ordering::Relaxed),
            write_queries: self.write.load(Ordering::Relaxed),
            failed_queries: self.failed.load(Ordering::Relaxed),
            slow_queries: self.slow.load(Ordering::Relaxed),
            avg_response_time_ms,
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            failover_count: self.failovers.load(Ordering::Relaxed),
            active_connections,
            idle_connections,
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Point-in-time service metrics
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseMetrics {
    pub total_queries: u64,
    pub read_queries: u64,
    pub write_queries: u64,
    pub failed_queries: u64,
    pub slow_queries: u64,
    pub avg_response_time_ms: f64,
    pub connection_errors: u64,
    pub pool_exhausted: u64,
    pub failover_count: u64,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

impl DatabaseMetrics {
    /// Percentage of queries that succeeded; 0 before the first query
    pub fn success_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        (self.total_queries - self.failed_queries) as f64 / self.total_queries as f64 * 100.0
    }

    /// Percentage of queries that failed; 0 before the first query
    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.failed_queries as f64 / self.total_queries as f64 * 100.0
    }
}
