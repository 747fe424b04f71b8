//! Scripted in-memory driver for unit tests
//!
//! Each `host:port` maps to a [`FakeServer`] whose reachability, lag and
//! latency tests can flip at any time. Handles follow `retarget` like the
//! real pool does.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::DatabaseConfig;

use super::{DbHandle, DbStats, DbTransaction, Driver, DriverError, ExecResult, ResultSet};

#[derive(Debug)]
pub struct FakeServer {
    pub reachable: AtomicBool,
    pub read_only: AtomicBool,
    pub lag: Mutex<Option<Duration>>,
    /// Replication threads are stopped; lag checks fail
    pub replication_stopped: AtomicBool,
    pub ping_delay: Mutex<Duration>,
    pub ping_count: AtomicU64,
    /// Statements containing this text fail with a server error
    pub fail_on: Mutex<Option<String>>,
    pub executed: Mutex<Vec<String>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            read_only: AtomicBool::new(false),
            lag: Mutex::new(None),
            replication_stopped: AtomicBool::new(false),
            ping_delay: Mutex::new(Duration::ZERO),
            ping_count: AtomicU64::new(0),
            fail_on: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
        }
    }
}

impl FakeServer {
    fn check_reachable(&self) -> Result<(), DriverError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::Connect("connection refused".into()))
        }
    }

    fn run(&self, sql: &str) -> Result<(), DriverError> {
        self.check_reachable()?;
        if let Some(pattern) = self.fail_on.lock().as_deref() {
            if sql.contains(pattern) {
                return Err(DriverError::Server {
                    code: 1064,
                    sql_state: "42000".into(),
                    message: format!("scripted failure for {}", sql),
                });
            }
        }
        self.executed.lock().push(sql.to_string());
        Ok(())
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

type Servers = Arc<DashMap<String, Arc<FakeServer>>>;

fn server_for(servers: &Servers, addr: &str) -> Arc<FakeServer> {
    servers.entry(addr.to_string()).or_default().clone()
}

#[derive(Default)]
pub struct FakeDriver {
    servers: Servers,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    pub fail_open: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn server(&self, addr: &str) -> Arc<FakeServer> {
        server_for(&self.servers, addr)
    }

    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        self.server(addr).reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_lag(&self, addr: &str, lag: Option<Duration>) {
        *self.server(addr).lag.lock() = lag;
    }

    pub fn set_replication_stopped(&self, addr: &str, stopped: bool) {
        self.server(addr)
            .replication_stopped
            .store(stopped, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, addr: &str, delay: Duration) {
        *self.server(addr).ping_delay.lock() = delay;
    }

    pub fn fail_on(&self, addr: &str, pattern: &str) {
        *self.server(addr).fail_on.lock() = Some(pattern.to_string());
    }

    /// Handles opened so far, in order
    pub fn handles(&self) -> Vec<Arc<FakeHandle>> {
        self.handles.lock().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn open(&self, config: &DatabaseConfig) -> Result<Arc<dyn DbHandle>, DriverError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DriverError::Connect("scripted open failure".into()));
        }
        let handle = Arc::new(FakeHandle {
            servers: self.servers.clone(),
            target: RwLock::new(config.addr()),
            stats: Mutex::new(DbStats {
                max_open_connections: config.max_open_conns,
                ..DbStats::default()
            }),
            closed: AtomicBool::new(false),
        });
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }
}

pub struct FakeHandle {
    servers: Servers,
    target: RwLock<String>,
    stats: Mutex<DbStats>,
    pub closed: AtomicBool,
}

impl FakeHandle {
    pub fn target(&self) -> String {
        self.target.read().clone()
    }

    pub fn set_stats(&self, stats: DbStats) {
        *self.stats.lock() = stats;
    }

    fn server(&self) -> Arc<FakeServer> {
        server_for(&self.servers, &self.target())
    }
}

#[async_trait]
impl DbHandle for FakeHandle {
    async fn ping(&self) -> Result<(), DriverError> {
        let server = self.server();
        server.ping_count.fetch_add(1, Ordering::SeqCst);
        let delay = *server.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        server.check_reachable()
    }

    async fn execute(&self, sql: &str) -> Result<ExecResult, DriverError> {
        self.server().run(sql)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: 0,
        })
    }

    async fn query(&self, sql: &str) -> Result<ResultSet, DriverError> {
        self.server().run(sql)?;
        Ok(ResultSet {
            columns: vec!["1".into()],
            rows: vec![vec![Some("1".into())]],
        })
    }

    async fn begin(&self) -> Result<Box<dyn DbTransaction>, DriverError> {
        let server = self.server();
        server.run("BEGIN")?;
        Ok(Box::new(FakeTransaction { server }))
    }

    fn stats(&self) -> DbStats {
        *self.stats.lock()
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn retarget(&self, host: &str, port: u16) {
        *self.target.write() = format!("{}:{}", host, port);
    }

    async fn set_read_only(&self, read_only: bool) -> Result<(), DriverError> {
        let server = self.server();
        server.run(if read_only {
            "SET GLOBAL read_only = ON"
        } else {
            "SET GLOBAL read_only = OFF"
        })?;
        server.read_only.store(read_only, Ordering::SeqCst);
        Ok(())
    }

    async fn replication_lag(&self) -> Result<Option<Duration>, DriverError> {
        let server = self.server();
        server.check_reachable()?;
        if server.replication_stopped.load(Ordering::SeqCst) {
            return Err(DriverError::ReplicationStopped(
                "Seconds_Behind_Source is NULL".into(),
            ));
        }
        let lag = *server.lag.lock();
        Ok(lag)
    }
}

struct FakeTransaction {
    server: Arc<FakeServer>,
}

#[async_trait]
impl DbTransaction for FakeTransaction {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, DriverError> {
        self.server.run(sql)?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: 0,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        self.server.run("COMMIT")
    }

    async fn rollback(self: Box<Self>) -> Result<(), DriverError> {
        self.server.run("ROLLBACK")
    }
}
