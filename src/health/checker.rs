//! Periodic health checking of instances, pools and clusters

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterRegistry;
use crate::config::HealthCheckConfig;
use crate::driver::{DbHandle, DriverError};
use crate::instance::{HealthCheck, InstanceError, InstanceRegistry};
use crate::metrics::metrics;
use crate::pool::{ConnectionPool, ConnectionPoolRegistry};
use crate::scheduler::PeriodicTask;

use super::report::HealthReport;

/// Error surfaced by health checker operations
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("health checker is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Ping `handle` within `limit`, optionally following up with `SELECT 1`
///
/// Returns the slower of the two round trips.
pub async fn probe_handle(
    handle: &dyn DbHandle,
    limit: Duration,
    with_query: bool,
) -> Result<Duration, DriverError> {
    let probe = async {
        let start = Instant::now();
        handle.ping().await?;
        let mut elapsed = start.elapsed();
        if with_query {
            let query_start = Instant::now();
            handle.query("SELECT 1").await?;
            elapsed = elapsed.max(query_start.elapsed());
        }
        Ok(elapsed)
    };
    match timeout(limit, probe).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(limit)),
    }
}

pub struct HealthChecker {
    config: HealthCheckConfig,
    instances: Arc<InstanceRegistry>,
    pools: Arc<ConnectionPoolRegistry>,
    clusters: Arc<ClusterRegistry>,
    task: Mutex<Option<PeriodicTask>>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        instances: Arc<InstanceRegistry>,
        pools: Arc<ConnectionPoolRegistry>,
        clusters: Arc<ClusterRegistry>,
    ) -> Self {
        Self {
            config,
            instances,
            pools,
            clusters,
            task: Mutex::new(None),
        }
    }

    /// Start the periodic check task under a child of `shutdown`
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<(), HealthError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| t.is_running()) {
            return Err(HealthError::AlreadyRunning);
        }

        let checker = Arc::clone(self);
        // Stagger the first round by up to a tenth of the interval
        *task = Some(PeriodicTask::spawn_jittered(
            "health-check",
            self.config.check_interval(),
            self.config.check_interval() / 10,
            shutdown,
            move || {
                let checker = checker.clone();
                async move { checker.perform_health_checks().await }
            },
        ));

        info!(
            interval_ms = self.config.check_interval_ms,
            probe_timeout_ms = self.config.probe_timeout_ms,
            "Health checker started"
        );
        Ok(())
    }

    /// Stop the periodic task; a no-op when not running
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.stop();
            info!("Health checker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| t.is_running())
    }

    /// One full round: instances, then pools, then cluster health
    pub async fn perform_health_checks(&self) {
        let instances = self.instances.get_all_database_instances();
        let probes = instances.iter().map(|instance| async move {
            if let Err(e) = self.check_instance_health(&instance.id).await {
                // Removed concurrently
                debug!(instance_id = %instance.id, error = %e, "Skipped instance health check");
            }
        });
        join_all(probes).await;

        let pools = self.pools.get_all_connection_pools();
        join_all(pools.iter().map(|pool| self.check_pool_health(pool))).await;

        for cluster in self.clusters.get_all_clusters() {
            if let Err(e) = self
                .clusters
                .update_cluster_health(&cluster.id, &self.instances, &self.pools)
            {
                warn!(cluster_id = %cluster.id, error = %e, "Failed to update cluster health");
            }
        }

        let counts = self.instances.status_counts();
        metrics().set_health_instances(
            counts.healthy as i64,
            counts.unhealthy as i64,
            counts.unknown as i64,
        );
        debug!(
            healthy = counts.healthy,
            unhealthy = counts.unhealthy,
            unknown = counts.unknown,
            pools = pools.len(),
            "Health check round complete"
        );
    }

    /// Probe one instance through the pool serving its address and record the result
    pub async fn check_instance_health(&self, instance_id: &str) -> Result<HealthCheck, HealthError> {
        let instance = self.instances.get_database_instance(instance_id)?;
        let addr = instance.addr();

        let Some(pool) = self.pools.find_by_database_id(&addr) else {
            metrics().record_health_check("no_pool");
            let updated = self.instances.record_check_failure(
                instance_id,
                "no connection pool found",
                Duration::ZERO,
            )?;
            return Ok(updated.health);
        };

        let start = Instant::now();
        let updated = match probe_handle(pool.handle.as_ref(), self.config.probe_timeout(), false).await {
            Ok(response_time) => {
                metrics().record_health_check("success");
                let stats = pool.handle.stats();
                let health = HealthCheck {
                    active_conns: stats.in_use,
                    idle_conns: stats.idle,
                    waiting_conns: stats.wait_count,
                    ..HealthCheck::success(response_time)
                };
                self.instances.update_instance_health(instance_id, health)?
            }
            Err(e) => {
                metrics().record_health_check("failure");
                debug!(instance_id = %instance_id, addr = %addr, error = %e, "Instance probe failed");
                self.instances
                    .record_check_failure(instance_id, e.to_string(), start.elapsed())?
            }
        };
        Ok(updated.health)
    }

    /// Refresh pool statistics, warn on pressure and test connectivity
    async fn check_pool_health(&self, pool: &ConnectionPool) {
        let stats = match self.pools.refresh_stats(&pool.id) {
            Ok(stats) => stats,
            Err(_) => return, // destroyed since listing
        };
        self.pools.mark_health_checked(&pool.id);

        let utilization = stats.utilization();
        if utilization > 90.0 {
            warn!(
                pool_id = %pool.id,
                utilization = format!("{:.2}", utilization),
                "High connection pool utilization"
            );
        }
        if stats.has_wait_pressure() {
            warn!(
                pool_id = %pool.id,
                wait_count = stats.wait_count,
                wait_duration_ms = stats.wait_duration.as_millis() as u64,
                "Connection wait pressure on pool"
            );
        }

        if let Err(e) =
            probe_handle(pool.handle.as_ref(), self.config.pool_probe_timeout(), false).await
        {
            warn!(pool_id = %pool.id, database_id = %pool.database_id, error = %e, "Connection pool failed ping test");
        }
    }

    /// Build a report from the current registry contents
    pub fn health_report(&self) -> HealthReport {
        let instances = self.instances.get_all_database_instances();
        let pools = self
            .pools
            .get_all_connection_pools()
            .into_iter()
            .map(|pool| (pool.id, pool.stats))
            .collect();
        let clusters: BTreeMap<_, _> = self
            .clusters
            .get_all_clusters()
            .into_iter()
            .filter_map(|cluster| {
                self.clusters
                    .get_cluster_health(&cluster.id, &self.instances, &self.pools)
                    .ok()
                    .map(|health| (cluster.id, health))
            })
            .collect();

        HealthReport::build(&instances, pools, clusters)
    }
}
