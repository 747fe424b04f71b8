//! Database driver abstraction
//!
//! The HA layer talks to backends only through [`Driver`] and [`DbHandle`].
//! A handle represents a whole pool of connections to one server; callers
//! never see individual connections.

pub mod mysql;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::DatabaseConfig;

pub use mysql::MySqlDriver;

/// Opens pooled handles to database servers
#[async_trait]
pub trait Driver: Send + Sync {
    /// Build a handle for `config`. Implementations may defer connecting
    /// until first use; callers probe with [`DbHandle::ping`].
    async fn open(&self, config: &DatabaseConfig) -> Result<Arc<dyn DbHandle>, DriverError>;
}

/// A pooled handle to one database server
#[async_trait]
pub trait DbHandle: Send + Sync {
    async fn ping(&self) -> Result<(), DriverError>;

    /// Run a statement that returns no rows
    async fn execute(&self, sql: &str) -> Result<ExecResult, DriverError>;

    /// Run a statement and collect its text result set
    async fn query(&self, sql: &str) -> Result<ResultSet, DriverError>;

    /// Start a transaction pinned to one connection
    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DriverError>;

    /// In-memory pool counters; never does I/O
    fn stats(&self) -> DbStats;

    /// Close idle connections and refuse new checkouts
    async fn close(&self) -> Result<(), DriverError>;

    /// Point future connections at another server. Idle connections to the
    /// previous server are discarded; in-flight ones finish where they are.
    fn retarget(&self, host: &str, port: u16);

    /// Toggle the server's global `read_only` flag
    async fn set_read_only(&self, read_only: bool) -> Result<(), DriverError>;

    /// Replication delay as seen by this server, `None` when it is not a
    /// replica. A replica whose replication is stopped or broken fails with
    /// [`DriverError::ReplicationStopped`].
    async fn replication_lag(&self) -> Result<Option<Duration>, DriverError>;
}

/// A transaction holding a dedicated connection until commit or rollback
#[async_trait]
pub trait DbTransaction: Send {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, DriverError>;

    async fn commit(self: Box<Self>) -> Result<(), DriverError>;

    async fn rollback(self: Box<Self>) -> Result<(), DriverError>;
}

/// Outcome of a statement without a result set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// Text result set; `None` cells are SQL NULL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// Value of `column` in the first row
    pub fn first_value(&self, column: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.first()?.get(idx)?.as_deref()
    }
}

/// Pool counters reported by a handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DbStats {
    pub max_open_connections: usize,
    pub open_connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub wait_count: u64,
    pub wait_duration: Duration,
    pub max_idle_closed: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

/// Driver errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Server error {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Pool is closed")]
    Closed,

    #[error("Connection disconnected")]
    Disconnected,

    #[error("Replication is not running: {0}")]
    ReplicationStopped(String),
}

impl DriverError {
    /// True when the server could not be reached at all, as opposed to the
    /// server rejecting the command
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            DriverError::Connect(_)
                | DriverError::Io(_)
                | DriverError::Timeout(_)
                | DriverError::Closed
                | DriverError::Disconnected
        )
    }
}
