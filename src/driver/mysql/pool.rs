use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::driver::{DbHandle, DbStats, DbTransaction, DriverError, ExecResult, ResultSet};

use super::connection::MySqlConnection;
use super::transaction::MySqlTransaction;

/// MySQL error 1064: statement not understood (e.g. SHOW SLAVE STATUS on 8.4+)
const ER_PARSE_ERROR: u16 = 1064;

/// A bounded pool of connections to one MySQL server
///
/// At most `max_open_conns` connections exist at once; callers beyond that
/// wait for a permit and are counted in `wait_count`. Released connections
/// are reset and kept idle up to `max_idle_conns`.
pub struct MySqlPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    config: DatabaseConfig,
    /// Current server address (host:port); rewritten by `retarget`
    target: RwLock<String>,
    /// Bumped on every retarget so connections to the old server are dropped
    generation: AtomicU64,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<MySqlConnection>>,
    closed: AtomicBool,
    open: AtomicUsize,
    in_use: AtomicUsize,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    max_idle_closed: AtomicU64,
    max_idle_time_closed: AtomicU64,
    max_lifetime_closed: AtomicU64,
}

/// A connection checked out of the pool together with its permit
pub(crate) struct Checkout {
    pub(crate) conn: MySqlConnection,
    guard: InUseGuard,
    _permit: OwnedSemaphorePermit,
}

/// Fixes the counters when a checkout is dropped without being checked in,
/// e.g. when the caller's future is cancelled by a timeout
struct InUseGuard {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl InUseGuard {
    fn disarm(&mut self) {
        self.armed = false;
        self.shared.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.in_use.fetch_sub(1, Ordering::Relaxed);
            self.shared.open.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl MySqlPool {
    pub fn new(config: DatabaseConfig) -> Self {
        let target = config.addr();
        let permits = Arc::new(Semaphore::new(config.max_open_conns));
        Self {
            shared: Arc::new(PoolShared {
                config,
                target: RwLock::new(target),
                generation: AtomicU64::new(0),
                permits,
                idle: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                open: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                wait_count: AtomicU64::new(0),
                wait_nanos: AtomicU64::new(0),
                max_idle_closed: AtomicU64::new(0),
                max_idle_time_closed: AtomicU64::new(0),
                max_lifetime_closed: AtomicU64::new(0),
            }),
        }
    }

    /// Current server address
    pub fn target(&self) -> String {
        self.shared.target.read().clone()
    }
}

impl PoolShared {
    /// Check out a connection, reusing an idle one when possible
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Checkout, DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(DriverError::Closed),
            Err(TryAcquireError::NoPermits) => {
                self.wait_count.fetch_add(1, Ordering::Relaxed);
                let start = Instant::now();
                let permit = self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DriverError::Closed)?;
                self.wait_nanos
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                permit
            }
        };

        let generation = self.generation.load(Ordering::Acquire);

        {
            let mut idle = self.idle.lock().await;
            while let Some(conn) = idle.pop_front() {
                if conn.generation() != generation {
                    debug!(addr = %conn.addr(), "Discarding connection to previous target");
                    self.open.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                if conn.is_expired(self.config.conn_max_lifetime()) {
                    debug!("Connection expired, discarding");
                    self.max_lifetime_closed.fetch_add(1, Ordering::Relaxed);
                    self.open.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                if conn.is_idle_too_long(self.config.conn_max_idle_time()) {
                    debug!("Connection idle too long, discarding");
                    self.max_idle_time_closed.fetch_add(1, Ordering::Relaxed);
                    self.open.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Ok(Checkout {
                    conn,
                    guard: InUseGuard {
                        shared: self.clone(),
                        armed: true,
                    },
                    _permit: permit,
                });
            }
        }

        let addr = self.target.read().clone();
        let conn = MySqlConnection::connect(&self.config, &addr, generation).await?;
        self.open.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        debug!(addr = %addr, "Opened new connection");

        Ok(Checkout {
            conn,
            guard: InUseGuard {
                shared: self.clone(),
                armed: true,
            },
            _permit: permit,
        })
    }

    /// Return a connection to the pool
    ///
    /// Broken, stale or expired connections are dropped. With `reset`, session
    /// state is cleared (COM_RESET_CONNECTION) before the connection goes idle.
    pub(crate) async fn checkin(&self, checkout: Checkout, reset: bool) {
        let Checkout {
            mut conn,
            mut guard,
            _permit,
        } = checkout;
        guard.disarm();

        let reusable = !conn.is_broken()
            && !self.closed.load(Ordering::Acquire)
            && conn.generation() == self.generation.load(Ordering::Acquire);
        if !reusable {
            self.open.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        if conn.is_expired(self.config.conn_max_lifetime()) {
            self.max_lifetime_closed.fetch_add(1, Ordering::Relaxed);
            self.open.fetch_sub(1, Ordering::Relaxed);
            conn.quit().await;
            return;
        }

        if reset {
            if let Err(e) = conn.reset().await {
                warn!(error = %e, "Failed to reset connection, discarding");
                self.open.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.config.max_idle_conns {
            drop(idle);
            debug!("Pool full, discarding connection");
            self.max_idle_closed.fetch_add(1, Ordering::Relaxed);
            self.open.fetch_sub(1, Ordering::Relaxed);
            conn.quit().await;
            return;
        }
        idle.push_back(conn);
    }
}

#[async_trait]
impl DbHandle for MySqlPool {
    async fn ping(&self) -> Result<(), DriverError> {
        let mut checkout = self.shared.acquire().await?;
        let result = checkout.conn.ping().await;
        self.shared.checkin(checkout, false).await;
        result
    }

    async fn execute(&self, sql: &str) -> Result<ExecResult, DriverError> {
        let mut checkout = self.shared.acquire().await?;
        let result = checkout.conn.execute(sql).await;
        self.shared.checkin(checkout, true).await;
        result
    }

    async fn query(&self, sql: &str) -> Result<ResultSet, DriverError> {
        let mut checkout = self.shared.acquire().await?;
        let result = checkout.conn.query(sql).await;
        self.shared.checkin(checkout, true).await;
        result
    }

    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DriverError> {
        let mut checkout = self.shared.acquire().await?;
        if let Err(e) = checkout.conn.execute("BEGIN").await {
            self.shared.checkin(checkout, true).await;
            return Err(e);
        }
        Ok(Box::new(MySqlTransaction::new(self.shared.clone(), checkout)))
    }

    fn stats(&self) -> DbStats {
        let shared = &self.shared;
        let open = shared.open.load(Ordering::Relaxed);
        let in_use = shared.in_use.load(Ordering::Relaxed);
        DbStats {
            max_open_connections: shared.config.max_open_conns,
            open_connections: open,
            in_use,
            idle: open.saturating_sub(in_use),
            wait_count: shared.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(shared.wait_nanos.load(Ordering::Relaxed)),
            max_idle_closed: shared.max_idle_closed.load(Ordering::Relaxed),
            max_idle_time_closed: shared.max_idle_time_closed.load(Ordering::Relaxed),
            max_lifetime_closed: shared.max_lifetime_closed.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.permits.close();

        let drained: Vec<MySqlConnection> = self.shared.idle.lock().await.drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.shared.open.fetch_sub(1, Ordering::Relaxed);
            conn.quit().await;
        }

        info!(addr = %self.target(), closed = count, "Closed connection pool");
        Ok(())
    }

    fn retarget(&self, host: &str, port: u16) {
        let new_target = format!("{}:{}", host, port);
        let old_target = std::mem::replace(&mut *self.shared.target.write(), new_target.clone());
        self.shared.generation.fetch_add(1, Ordering::AcqRel);

        // Idle connections to the old server are purged now when the lock is
        // free, otherwise on the next checkout.
        if let Ok(mut idle) = self.shared.idle.try_lock() {
            let stale = idle.len();
            idle.clear();
            self.shared.open.fetch_sub(stale, Ordering::Relaxed);
        }

        info!(from = %old_target, to = %new_target, "Retargeted connection pool");
    }

    async fn set_read_only(&self, read_only: bool) -> Result<(), DriverError> {
        let sql = if read_only {
            "SET GLOBAL read_only = ON"
        } else {
            "SET GLOBAL read_only = OFF"
        };
        self.execute(sql).await.map(|_| ())
    }

    async fn replication_lag(&self) -> Result<Option<Duration>, DriverError> {
        let (status, column) = match self.query("SHOW SLAVE STATUS").await {
            Ok(rs) => (rs, "Seconds_Behind_Master"),
            Err(DriverError::Server { code, .. }) if code == ER_PARSE_ERROR => {
                (self.query("SHOW REPLICA STATUS").await?, "Seconds_Behind_Source")
            }
            Err(e) => return Err(e),
        };

        lag_from_status(&status, column)
    }
}

/// Lag reported by a `SHOW SLAVE STATUS` / `SHOW REPLICA STATUS` result
///
/// No row means the server is not a replica. A NULL lag cell means the
/// replication threads are stopped or broken, which is never "caught up".
pub(crate) fn lag_from_status(status: &ResultSet, column: &str) -> Result<Option<Duration>, DriverError> {
    let Some(row) = status.rows.first() else {
        return Ok(None);
    };
    let idx = status
        .columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(column))
        .ok_or_else(|| DriverError::Protocol(format!("Replication status has no {} column", column)))?;

    match row.get(idx).and_then(|cell| cell.as_deref()) {
        None => Err(DriverError::ReplicationStopped(format!("{} is NULL", column))),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| DriverError::Protocol(format!("Invalid {} value: {}", column, value))),
    }
}
