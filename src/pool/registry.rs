use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, DatabaseConfig};
use crate::driver::{DbHandle, Driver, DriverError};
use crate::metrics::metrics;

use super::stats::PoolStats;

/// A named pool of connections to one database server
///
/// Snapshots share the live handle; everything else is a copy.
#[derive(Clone)]
pub struct ConnectionPool {
    pub id: String,
    pub name: String,
    /// Server address (host:port); rewritten when a failover repoints the pool
    pub database_id: String,
    pub handle: Arc<dyn DbHandle>,
    pub config: DatabaseConfig,
    pub stats: PoolStats,
    pub created_at: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("database_id", &self.database_id)
            .field("stats", &self.stats)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Connection pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to open database connection: {0}")]
    Open(#[source] DriverError),

    #[error("failed to ping database: {0}")]
    Ping(#[source] DriverError),

    #[error("connection pool not found: {0}")]
    NotFound(String),
}

/// Registry of connection pools keyed by pool ID
pub struct ConnectionPoolRegistry {
    driver: Arc<dyn Driver>,
    pools: DashMap<String, ConnectionPool>,
}

impl ConnectionPoolRegistry {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            pools: DashMap::new(),
        }
    }

    /// Open and verify a pool for `config`
    ///
    /// The handle is probed with a ping bounded by the pool's connect timeout
    /// and closed again if the probe fails; nothing is registered then.
    pub async fn create_connection_pool(
        &self,
        config: DatabaseConfig,
    ) -> Result<ConnectionPool, PoolError> {
        config.validate()?;

        let handle = self.driver.open(&config).await.map_err(PoolError::Open)?;

        let connect_timeout = config.connect_timeout();
        let probe = match timeout(connect_timeout, handle.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(connect_timeout)),
        };
        if let Err(e) = probe {
            warn!(addr = %config.addr(), error = %e, "Connection pool probe failed");
            if let Err(close_err) = handle.close().await {
                warn!(addr = %config.addr(), error = %close_err, "Failed to close unusable pool");
            }
            return Err(PoolError::Ping(e));
        }

        let now = Utc::now();
        let pool = ConnectionPool {
            id: format!("pool_{}", Uuid::new_v4().simple()),
            name: format!("pool_{}_{}", config.host, config.port),
            database_id: config.addr(),
            stats: handle.stats().into(),
            handle,
            config,
            created_at: now,
            last_health_check: now,
            metadata: HashMap::new(),
        };

        self.pools.insert(pool.id.clone(), pool.clone());
        info!(pool_id = %pool.id, database_id = %pool.database_id, "Created connection pool");
        Ok(pool)
    }

    pub fn get_connection_pool(&self, pool_id: &str) -> Result<ConnectionPool, PoolError> {
        self.pools
            .get(pool_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PoolError::NotFound(pool_id.to_string()))
    }

    /// All pools, oldest first
    pub fn get_all_connection_pools(&self) -> Vec<ConnectionPool> {
        let mut pools: Vec<ConnectionPool> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        pools.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pools
    }

    /// Remove a pool and close its handle; close errors are only logged
    pub async fn destroy_connection_pool(&self, pool_id: &str) -> Result<(), PoolError> {
        let (_, pool) = self
            .pools
            .remove(pool_id)
            .ok_or_else(|| PoolError::NotFound(pool_id.to_string()))?;

        if let Err(e) = pool.handle.close().await {
            warn!(pool_id = %pool_id, error = %e, "Error closing connection pool");
        }
        metrics().remove_pool(pool_id);

        info!(pool_id = %pool_id, "Destroyed connection pool");
        Ok(())
    }

    /// Hand out the pool's handle after a ping bounded by `ping_timeout`
    pub async fn get_connection(
        &self,
        pool_id: &str,
        ping_timeout: Duration,
    ) -> Result<Arc<dyn DbHandle>, PoolError> {
        let handle = self.get_connection_pool(pool_id)?.handle;

        let probe = match timeout(ping_timeout, handle.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(ping_timeout)),
        };
        if let Err(e) = probe {
            metrics().record_connection_error();
            debug!(pool_id = %pool_id, error = %e, "Connection ping failed");
            return Err(PoolError::Ping(e));
        }

        Ok(handle)
    }

    /// Copy the handle's in-memory counters into the stored pool
    pub fn refresh_stats(&self, pool_id: &str) -> Result<PoolStats, PoolError> {
        let mut entry = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| PoolError::NotFound(pool_id.to_string()))?;
        let stats: PoolStats = entry.handle.stats().into();
        entry.stats = stats;
        drop(entry);

        metrics().set_pool_connections(pool_id, stats.open_connections, stats.in_use, stats.idle);
        Ok(stats)
    }

    /// Stamp the time of the last pool health check
    pub fn mark_health_checked(&self, pool_id: &str) {
        if let Some(mut entry) = self.pools.get_mut(pool_id) {
            entry.last_health_check = Utc::now();
        }
    }

    /// Oldest pool serving `database_id` (host:port)
    pub fn find_by_database_id(&self, database_id: &str) -> Option<ConnectionPool> {
        self.pools
            .iter()
            .filter(|entry| entry.database_id == database_id)
            .map(|entry| entry.value().clone())
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
    }

    /// Point every pool serving `old_database_id` at `host:port`
    ///
    /// Pools keep their IDs; only the address, config and handle target move.
    /// Returns the IDs of the repointed pools.
    pub fn repoint(&self, old_database_id: &str, host: &str, port: u16) -> Vec<String> {
        let new_database_id = format!("{}:{}", host, port);
        let mut repointed = Vec::new();

        for mut entry in self.pools.iter_mut() {
            if entry.database_id != old_database_id {
                continue;
            }
            entry.handle.retarget(host, port);
            entry.database_id = new_database_id.clone();
            entry.config.host = host.to_string();
            entry.config.port = port;
            entry
                .metadata
                .insert("failover_from".to_string(), old_database_id.to_string());
            repointed.push(entry.id.clone());
        }

        for pool_id in &repointed {
            info!(
                pool_id = %pool_id,
                from = %old_database_id,
                to = %new_database_id,
                "Repointed connection pool"
            );
        }
        repointed
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
