//! Programmatic facade over the HA layer
//!
//! [`HaService`] wires the registries, the health checker and the failover
//! manager together and is what request handlers and the daemon talk to.

mod transaction;

pub use transaction::{QueryRecord, Transaction, TransactionStatus};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterHealth, ClusterRegistry, DatabaseCluster, FailoverConfig};
use crate::config::{DatabaseConfig, HaConfig, ServiceConfig};
use crate::driver::{DbHandle, Driver, DriverError, ExecResult};
use crate::error::HaError;
use crate::failover::{FailoverManager, FailoverOperation};
use crate::health::{HealthChecker, HealthReport};
use crate::instance::{DatabaseInstance, HealthCheck, InstanceRegistry};
use crate::metrics::{metrics, DatabaseMetrics, QueryKind, QueryStats};
use crate::pool::{ConnectionPool, ConnectionPoolRegistry, PoolError, PoolStats};

pub struct HaService {
    config: ServiceConfig,
    instances: Arc<InstanceRegistry>,
    pools: Arc<ConnectionPoolRegistry>,
    clusters: Arc<ClusterRegistry>,
    health: Arc<HealthChecker>,
    failover: Arc<FailoverManager>,
    stats: Arc<QueryStats>,
    shutdown: CancellationToken,
}

impl HaService {
    pub fn new(config: &HaConfig, driver: Arc<dyn Driver>) -> Self {
        let instances = Arc::new(InstanceRegistry::new());
        let pools = Arc::new(ConnectionPoolRegistry::new(driver));
        let clusters = Arc::new(ClusterRegistry::new());
        let stats = Arc::new(QueryStats::new());

        let health = Arc::new(HealthChecker::new(
            config.health.clone(),
            instances.clone(),
            pools.clone(),
            clusters.clone(),
        ));
        let failover = Arc::new(FailoverManager::new(
            config.failover.clone(),
            instances.clone(),
            pools.clone(),
            clusters.clone(),
            stats.clone(),
        ));

        Self {
            config: config.service.clone(),
            instances,
            pools,
            clusters,
            health,
            failover,
            stats,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register the configured instances, open their pools and create the
    /// configured clusters
    ///
    /// A pool that cannot be opened is logged and skipped; the instance stays
    /// registered and reports "no connection pool found" until one exists.
    pub async fn bootstrap(&self, config: &HaConfig) -> Result<(), HaError> {
        for instance in &config.instances {
            let name = instance.name.clone().unwrap_or_else(|| instance.id.clone());
            self.instances.register_database_instance(
                DatabaseInstance::new(name, instance.host.clone(), instance.port, instance.role)
                    .with_id(instance.id.clone()),
            );

            let db_config = instance.to_database_config(&config.pool_defaults);
            if let Err(e) = self.pools.create_connection_pool(db_config).await {
                warn!(instance_id = %instance.id, addr = %instance.addr(), error = %e, "Could not open pool at startup");
            }
        }

        for cluster in &config.clusters {
            let name = cluster.name.clone().unwrap_or_else(|| cluster.id.clone());
            self.clusters.create_database_cluster(
                DatabaseCluster::new(name, cluster.primary.clone(), cluster.replicas.clone())
                    .with_id(cluster.id.clone())
                    .with_failover(FailoverConfig {
                        enabled: cluster.failover_enabled,
                        failure_threshold: cluster.failure_threshold,
                    }),
                &self.instances,
            )?;
        }

        info!(
            instances = self.instances.len(),
            pools = self.pools.len(),
            clusters = self.clusters.len(),
            "Topology bootstrapped"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection pools
    // ------------------------------------------------------------------

    pub async fn create_connection_pool(&self, config: DatabaseConfig) -> Result<ConnectionPool, HaError> {
        Ok(self.pools.create_connection_pool(config).await?)
    }

    pub fn get_connection_pool(&self, pool_id: &str) -> Result<ConnectionPool, HaError> {
        Ok(self.pools.get_connection_pool(pool_id)?)
    }

    pub fn get_all_connection_pools(&self) -> Vec<ConnectionPool> {
        self.pools.get_all_connection_pools()
    }

    pub async fn destroy_connection_pool(&self, pool_id: &str) -> Result<(), HaError> {
        Ok(self.pools.destroy_connection_pool(pool_id).await?)
    }

    /// Refreshed statistics of one pool
    pub fn get_pool_stats(&self, pool_id: &str) -> Result<PoolStats, HaError> {
        Ok(self.pools.refresh_stats(pool_id)?)
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    pub fn register_database_instance(&self, instance: DatabaseInstance) -> DatabaseInstance {
        self.instances.register_database_instance(instance)
    }

    pub fn get_database_instance(&self, id: &str) -> Result<DatabaseInstance, HaError> {
        Ok(self.instances.get_database_instance(id)?)
    }

    pub fn get_all_database_instances(&self) -> Vec<DatabaseInstance> {
        self.instances.get_all_database_instances()
    }

    pub fn remove_database_instance(&self, id: &str) -> Result<DatabaseInstance, HaError> {
        Ok(self.instances.remove_database_instance(id)?)
    }

    pub fn update_instance_health(&self, id: &str, health: HealthCheck) -> Result<DatabaseInstance, HaError> {
        Ok(self.instances.update_instance_health(id, health)?)
    }

    /// Probe one instance now and record the result
    pub async fn check_database_health(&self, instance_id: &str) -> Result<HealthCheck, HaError> {
        Ok(self.health.check_instance_health(instance_id).await?)
    }

    // ------------------------------------------------------------------
    // Clusters
    // ------------------------------------------------------------------

    pub fn create_database_cluster(&self, cluster: DatabaseCluster) -> Result<DatabaseCluster, HaError> {
        Ok(self.clusters.create_database_cluster(cluster, &self.instances)?)
    }

    pub fn get_database_cluster(&self, id: &str) -> Result<DatabaseCluster, HaError> {
        Ok(self.clusters.get_database_cluster(id)?)
    }

    pub fn get_all_clusters(&self) -> Vec<DatabaseCluster> {
        self.clusters.get_all_clusters()
    }

    pub fn get_cluster_health(&self, id: &str) -> Result<ClusterHealth, HaError> {
        Ok(self.clusters.get_cluster_health(id, &self.instances, &self.pools)?)
    }

    pub fn update_cluster_health(&self, id: &str) -> Result<ClusterHealth, HaError> {
        Ok(self.clusters.update_cluster_health(id, &self.instances, &self.pools)?)
    }

    // ------------------------------------------------------------------
    // Connections and queries
    // ------------------------------------------------------------------

    /// Handle of a pool after a ping bounded by the connection timeout
    pub async fn get_connection(&self, pool_id: &str) -> Result<Arc<dyn DbHandle>, HaError> {
        match self
            .pools
            .get_connection(pool_id, self.config.connection_timeout())
            .await
        {
            Ok(handle) => {
                let stats = handle.stats();
                if stats.max_open_connections > 0 && stats.in_use >= stats.max_open_connections {
                    self.stats.record_pool_exhausted();
                }
                Ok(handle)
            }
            Err(e) => {
                if matches!(e, PoolError::Ping(_)) {
                    self.stats.record_connection_error();
                }
                Err(e.into())
            }
        }
    }

    /// Connection to the cluster's primary
    pub async fn get_read_write_connection(&self, cluster_id: &str) -> Result<Arc<dyn DbHandle>, HaError> {
        let cluster = self.clusters.get_database_cluster(cluster_id)?;
        let primary = match self.instances.get_database_instance(&cluster.primary) {
            Ok(primary) if primary.is_healthy() => primary,
            _ => return Err(HaError::PrimaryUnavailable),
        };

        let pool = self
            .pools
            .find_by_database_id(&primary.addr())
            .ok_or(HaError::NoPrimaryPool)?;
        self.get_connection(&pool.id).await
    }

    /// Connection to the first healthy replica with a pool, else the primary
    pub async fn get_read_only_connection(&self, cluster_id: &str) -> Result<Arc<dyn DbHandle>, HaError> {
        let cluster = self.clusters.get_database_cluster(cluster_id)?;

        for replica_id in &cluster.replicas {
            let Ok(replica) = self.instances.get_database_instance(replica_id) else {
                continue;
            };
            if !replica.is_healthy() {
                continue;
            }
            if let Some(pool) = self.pools.find_by_database_id(&replica.addr()) {
                debug!(cluster_id = %cluster_id, replica = %replica.id, "Routing read to replica");
                return self.get_connection(&pool.id).await;
            }
        }

        debug!(cluster_id = %cluster_id, "No healthy replica, routing read to primary");
        self.get_read_write_connection(cluster_id).await
    }

    /// Run one statement on a pool, bounded by the query timeout
    pub async fn execute_query(&self, pool_id: &str, sql: &str) -> Result<ExecResult, HaError> {
        let start = Instant::now();
        let result = self.execute_query_inner(pool_id, sql).await;
        self.record_query(sql, start.elapsed(), result.is_err());
        result
    }

    async fn execute_query_inner(&self, pool_id: &str, sql: &str) -> Result<ExecResult, HaError> {
        let handle = self.get_connection(pool_id).await?;
        let limit = self.config.query_timeout();
        match timeout(limit, handle.execute(sql)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DriverError::Timeout(limit).into()),
        }
    }

    fn record_query(&self, sql: &str, elapsed: Duration, failed: bool) {
        let kind = QueryKind::classify(sql);
        let threshold = self.config.slow_query_threshold();
        self.stats.record_query(kind, elapsed, failed, threshold);
        metrics().record_query(kind, elapsed.as_secs_f64(), failed);
        if elapsed > threshold {
            warn!(
                kind = kind.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "Slow query"
            );
        }
    }

    /// Run `statements` in one transaction on a pool
    ///
    /// The first failing statement rolls the transaction back; the returned
    /// record is then `Aborted` and carries the error. Only failing to reach
    /// the pool or to begin is returned as `Err`.
    pub async fn execute_transaction<S: AsRef<str>>(
        &self,
        pool_id: &str,
        statements: &[S],
    ) -> Result<Transaction, HaError> {
        let handle = self.get_connection(pool_id).await?;
        let mut record = Transaction::begin();
        let mut tx = handle.begin().await?;
        let limit = self.config.query_timeout();

        for statement in statements {
            let sql = statement.as_ref();
            let start = Instant::now();
            let result = match timeout(limit, tx.execute(sql)).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(DriverError::Timeout(limit)),
            };
            let elapsed = start.elapsed();
            self.record_query(sql, elapsed, result.is_err());

            let error = result.err().map(|e| e.to_string());
            record.queries.push(QueryRecord {
                sql: sql.to_string(),
                duration: elapsed,
                error: error.clone(),
            });

            if let Some(error) = error {
                if let Err(e) = tx.rollback().await {
                    warn!(transaction_id = %record.id, error = %e, "Rollback failed");
                }
                debug!(transaction_id = %record.id, error = %error, "Transaction aborted");
                record.finish(TransactionStatus::Aborted, Some(error));
                return Ok(record);
            }
        }

        match tx.commit().await {
            Ok(()) => record.finish(TransactionStatus::Committed, None),
            Err(e) => record.finish(TransactionStatus::Aborted, Some(e.to_string())),
        }
        debug!(
            transaction_id = %record.id,
            status = ?record.status,
            statements = record.queries.len(),
            "Transaction finished"
        );
        Ok(record)
    }

    /// Service counters plus connection totals over all pools
    pub fn get_database_metrics(&self) -> DatabaseMetrics {
        let (active, idle) = self
            .pools
            .get_all_connection_pools()
            .iter()
            .fold((0, 0), |(active, idle), pool| {
                (active + pool.stats.in_use, idle + pool.stats.idle)
            });
        self.stats.snapshot(active, idle)
    }

    // ------------------------------------------------------------------
    // Health and failover
    // ------------------------------------------------------------------

    pub fn health_report(&self) -> HealthReport {
        self.health.health_report()
    }

    pub fn start_health_checking(&self) -> Result<(), HaError> {
        Ok(self.health.start(&self.shutdown)?)
    }

    pub fn stop_health_checking(&self) {
        self.health.stop();
    }

    pub fn start_failover_monitor(&self) -> Result<(), HaError> {
        Ok(self.failover.start_monitoring(&self.shutdown)?)
    }

    pub fn stop_failover_monitor(&self) {
        self.failover.stop_monitoring();
    }

    pub fn set_auto_failover(&self, enabled: bool) {
        self.failover.set_auto_failover(enabled);
    }

    pub fn trigger_failover(&self, cluster_id: &str) -> Result<FailoverOperation, HaError> {
        Ok(self.failover.trigger_failover(cluster_id)?)
    }

    pub fn check_failover_status(&self, cluster_id: &str) -> bool {
        self.failover.check_failover_status(cluster_id)
    }

    pub fn failover_operation(&self, cluster_id: &str) -> Result<FailoverOperation, HaError> {
        Ok(self.failover.failover_operation(cluster_id)?)
    }

    pub fn failover_operations(&self) -> Vec<FailoverOperation> {
        self.failover.failover_operations()
    }

    /// Stop background tasks and close every pool
    ///
    /// Failover operations already running are not cancelled; pools are
    /// closed only once they have finished.
    pub async fn shutdown(&self) {
        info!("Shutting down HA service");
        self.shutdown.cancel();
        self.health.stop();
        self.failover.stop_monitoring();
        self.failover.wait_for_operations().await;

        for pool in self.pools.get_all_connection_pools() {
            if let Err(e) = self.pools.destroy_connection_pool(&pool.id).await {
                warn!(pool_id = %pool.id, error = %e, "Failed to destroy pool during shutdown");
            }
        }
    }
}
