//! Failover detection and the promotion state machine

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterError, ClusterRegistry, DatabaseCluster};
use crate::config::FailoverManagerConfig;
use crate::instance::{DatabaseInstance, HealthCheck, InstanceError, InstanceRegistry};
use crate::metrics::{metrics, QueryStats};
use crate::pool::ConnectionPoolRegistry;
use crate::scheduler::PeriodicTask;

use super::operation::{FailoverOperation, FailoverStatus};
use super::steps::StepContext;

/// Errors returned when a failover cannot be started or looked up
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("failover already in progress for cluster {0}")]
    AlreadyInProgress(String),

    #[error("failover is disabled for cluster {0}")]
    Disabled(String),

    #[error("no replicas available for promotion")]
    NoReplicas,

    #[error("no healthy replica found for promotion")]
    NoHealthyReplica,

    #[error("no failover operation for cluster {0}")]
    NotFound(String),

    #[error("failover monitor is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Promotion preference of a replica; higher is better
///
/// Each consecutive failure costs 10 points, each millisecond of response
/// time 0.01.
pub fn health_score(health: &HealthCheck) -> f64 {
    100.0
        - 10.0 * health.consecutive_fails as f64
        - 0.01 * health.response_time.as_secs_f64() * 1000.0
}

/// Pick the healthy replica with the best score; the first one wins ties
pub fn select_new_primary(
    cluster: &DatabaseCluster,
    instances: &InstanceRegistry,
) -> Result<DatabaseInstance, FailoverError> {
    if cluster.replicas.is_empty() {
        return Err(FailoverError::NoReplicas);
    }

    let mut best: Option<(f64, DatabaseInstance)> = None;
    for id in &cluster.replicas {
        let Ok(replica) = instances.get_database_instance(id) else {
            continue;
        };
        if !replica.is_healthy() {
            continue;
        }
        let score = health_score(&replica.health);
        if best.as_ref().map_or(true, |(top, _)| score > *top) {
            best = Some((score, replica));
        }
    }

    best.map(|(_, replica)| replica)
        .ok_or(FailoverError::NoHealthyReplica)
}

type SharedOperation = Arc<RwLock<FailoverOperation>>;

pub struct FailoverManager {
    config: FailoverManagerConfig,
    auto_failover: AtomicBool,
    instances: Arc<InstanceRegistry>,
    pools: Arc<ConnectionPoolRegistry>,
    clusters: Arc<ClusterRegistry>,
    stats: Arc<QueryStats>,
    operations: Mutex<HashMap<String, SharedOperation>>,
    /// Execution tasks of the latest operation per cluster
    executions: Mutex<HashMap<String, JoinHandle<()>>>,
    monitor: Mutex<Option<PeriodicTask>>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverManagerConfig,
        instances: Arc<InstanceRegistry>,
        pools: Arc<ConnectionPoolRegistry>,
        clusters: Arc<ClusterRegistry>,
        stats: Arc<QueryStats>,
    ) -> Self {
        Self {
            auto_failover: AtomicBool::new(config.auto_failover),
            config,
            instances,
            pools,
            clusters,
            stats,
            operations: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn auto_failover(&self) -> bool {
        self.auto_failover.load(Ordering::Relaxed)
    }

    /// Toggle the global gate for scan-triggered failover
    pub fn set_auto_failover(&self, enabled: bool) {
        if self.auto_failover.swap(enabled, Ordering::Relaxed) != enabled {
            info!(enabled, "Automatic failover toggled");
        }
    }

    /// Start the periodic scan under a child of `shutdown`
    pub fn start_monitoring(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<(), FailoverError> {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|t| t.is_running()) {
            return Err(FailoverError::AlreadyRunning);
        }

        let manager = Arc::clone(self);
        *monitor = Some(PeriodicTask::spawn(
            "failover-monitor",
            self.config.scan_interval(),
            shutdown,
            move || {
                let manager = manager.clone();
                async move {
                    manager.check_failover_conditions();
                }
            },
        ));

        info!(
            interval_ms = self.config.scan_interval_ms,
            auto_failover = self.auto_failover(),
            "Failover monitor started"
        );
        Ok(())
    }

    /// Stop the periodic scan; running operations are left to finish
    pub fn stop_monitoring(&self) {
        if let Some(task) = self.monitor.lock().take() {
            task.stop();
            info!("Failover monitor stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().as_ref().is_some_and(|t| t.is_running())
    }

    /// One scan: purge old operations and trigger failover where the primary
    /// has crossed its cluster's failure threshold
    ///
    /// Returns the clusters for which a failover was started.
    pub fn check_failover_conditions(self: &Arc<Self>) -> Vec<String> {
        self.purge_expired();

        if !self.auto_failover() {
            debug!("Automatic failover disabled, skipping scan");
            return Vec::new();
        }

        let mut triggered = Vec::new();
        for cluster in self.clusters.get_all_clusters() {
            if !cluster.failover.enabled {
                continue;
            }
            let Ok(primary) = self.instances.get_database_instance(&cluster.primary) else {
                warn!(cluster_id = %cluster.id, primary = %cluster.primary, "Cluster primary is not registered");
                continue;
            };
            if primary.is_healthy()
                || primary.health.consecutive_fails < cluster.failover.failure_threshold
                || self.check_failover_status(&cluster.id)
            {
                continue;
            }

            warn!(
                cluster_id = %cluster.id,
                primary = %primary.id,
                consecutive_fails = primary.health.consecutive_fails,
                threshold = cluster.failover.failure_threshold,
                "Primary crossed failure threshold, triggering failover"
            );
            match self.trigger_failover(&cluster.id) {
                Ok(_) => triggered.push(cluster.id),
                Err(FailoverError::AlreadyInProgress(_)) => {}
                Err(e) => {
                    error!(cluster_id = %cluster.id, error = %e, "Automatic failover could not start");
                    metrics().record_failover("rejected");
                }
            }
        }
        triggered
    }

    /// Start a promotion for `cluster_id` and return its initial snapshot
    ///
    /// Preconditions are checked under the manager lock; execution continues
    /// on a spawned task that outlives the caller.
    pub fn trigger_failover(self: &Arc<Self>, cluster_id: &str) -> Result<FailoverOperation, FailoverError> {
        let shared = {
            let mut operations = self.operations.lock();
            if operations
                .get(cluster_id)
                .is_some_and(|op| op.read().is_in_flight())
            {
                return Err(FailoverError::AlreadyInProgress(cluster_id.to_string()));
            }

            let cluster = self.clusters.get_database_cluster(cluster_id)?;
            if !cluster.failover.enabled {
                return Err(FailoverError::Disabled(cluster_id.to_string()));
            }
            let old_primary = self.instances.get_database_instance(&cluster.primary)?;
            let new_primary = select_new_primary(&cluster, &self.instances)?;

            info!(
                cluster_id = %cluster_id,
                old_primary = %old_primary.id,
                new_primary = %new_primary.id,
                "Failover initiated"
            );
            let shared = Arc::new(RwLock::new(FailoverOperation::new(
                cluster_id,
                old_primary,
                new_primary,
            )));
            operations.insert(cluster_id.to_string(), shared.clone());
            self.clusters.set_failover_active(cluster_id, true)?;
            shared
        };

        let snapshot = shared.read().clone();
        let manager = Arc::clone(self);
        let execution = tokio::spawn(async move { manager.run_operation(shared).await });
        self.executions
            .lock()
            .insert(cluster_id.to_string(), execution);
        Ok(snapshot)
    }

    /// Wait until every spawned operation has reached a terminal state
    pub async fn wait_for_operations(&self) {
        let executions: Vec<(String, JoinHandle<()>)> = self.executions.lock().drain().collect();
        let pending = executions.iter().filter(|(_, task)| !task.is_finished()).count();
        if pending > 0 {
            info!(pending, "Waiting for in-flight failover operations");
        }
        for (cluster_id, task) in executions {
            if let Err(e) = task.await {
                error!(cluster_id = %cluster_id, error = %e, "Failover task ended abnormally");
            }
        }
    }

    /// Drive every step in order, stopping at the first failure
    async fn run_operation(self: Arc<Self>, shared: SharedOperation) {
        let (cluster_id, old_primary, new_primary, kinds) = {
            let mut op = shared.write();
            op.begin();
            (
                op.cluster_id.clone(),
                op.old_primary.clone(),
                op.new_primary.clone(),
                op.steps.iter().map(|s| s.kind).collect::<Vec<_>>(),
            )
        };
        let ctx = StepContext {
            config: &self.config,
            instances: &self.instances,
            pools: &self.pools,
            clusters: &self.clusters,
            cluster_id: &cluster_id,
            old_primary: &old_primary,
            new_primary: &new_primary,
        };

        for (idx, kind) in kinds.into_iter().enumerate() {
            shared.write().start_step(idx);
            debug!(cluster_id = %cluster_id, step = kind.as_str(), "Failover step started");

            let started = Instant::now();
            let result = ctx.run(kind).await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(()) => {
                    shared.write().complete_step(idx);
                    metrics().record_failover_step(kind.as_str(), "completed", elapsed);
                    info!(cluster_id = %cluster_id, step = kind.as_str(), "Failover step completed");
                }
                Err(e) => {
                    shared.write().fail_step(idx, e.to_string());
                    metrics().record_failover_step(kind.as_str(), "failed", elapsed);
                    error!(cluster_id = %cluster_id, step = kind.as_str(), error = %e, "Failover step failed");
                    self.roll_back(&shared, &cluster_id);
                    return;
                }
            }
        }

        let duration = {
            let mut op = shared.write();
            op.complete();
            op.duration
        };
        metrics().record_failover("completed");
        self.stats.record_failover();
        info!(
            cluster_id = %cluster_id,
            old_primary = %old_primary.id,
            new_primary = %new_primary.id,
            duration_ms = duration.map(|d| d.as_millis() as u64).unwrap_or(0),
            "Failover completed"
        );
    }

    /// Relabel the operation; no compensation is attempted
    fn roll_back(&self, shared: &SharedOperation, cluster_id: &str) {
        shared.write().roll_back();
        if let Err(e) = self.clusters.set_failover_active(cluster_id, false) {
            warn!(cluster_id = %cluster_id, error = %e, "Failed to clear failover flag");
        }
        metrics().record_failover("rolled_back");
        warn!(cluster_id = %cluster_id, "Failover rolled back");
    }

    /// True while an operation for the cluster is initiated or running
    pub fn check_failover_status(&self, cluster_id: &str) -> bool {
        self.operations
            .lock()
            .get(cluster_id)
            .is_some_and(|op| op.read().is_in_flight())
    }

    pub fn failover_operation(&self, cluster_id: &str) -> Result<FailoverOperation, FailoverError> {
        self.operations
            .lock()
            .get(cluster_id)
            .map(|op| op.read().clone())
            .ok_or_else(|| FailoverError::NotFound(cluster_id.to_string()))
    }

    /// Snapshots of all retained operations, sorted by cluster ID
    pub fn failover_operations(&self) -> Vec<FailoverOperation> {
        let mut ops: Vec<FailoverOperation> = self
            .operations
            .lock()
            .values()
            .map(|op| op.read().clone())
            .collect();
        ops.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        ops
    }

    /// Drop finished operations older than the retention window
    pub fn purge_expired(&self) -> usize {
        let retention = match chrono::Duration::from_std(self.config.retention()) {
            Ok(retention) => retention,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - retention;

        let mut operations = self.operations.lock();
        let before = operations.len();
        operations.retain(|_, op| !op.read().expired(cutoff));
        let purged = before - operations.len();
        if purged > 0 {
            debug!(purged, "Purged finished failover operations");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, InstanceRole, PoolDefaults};
    use crate::driver::testing::FakeDriver;
    use crate::failover::StepKind;
    use std::time::Duration;

    struct Fixture {
        driver: Arc<FakeDriver>,
        instances: Arc<InstanceRegistry>,
        pools: Arc<ConnectionPoolRegistry>,
        clusters: Arc<ClusterRegistry>,
        manager: Arc<FailoverManager>,
    }

    fn set_health(instances: &InstanceRegistry, id: &str, fails: u32, response_ms: u64) {
        let rt = Duration::from_millis(response_ms);
        let health = if fails == 0 {
            HealthCheck::success(rt)
        } else {
            HealthCheck {
                consecutive_fails: fails,
                ..HealthCheck::failure(&HealthCheck::default(), "connection refused", rt)
            }
        };
        instances.update_instance_health(id, health).unwrap();
    }

    /// Cluster `c1` with primary `p` and replicas `r1`, `r2`, all healthy,
    /// one pool per instance
    async fn create_fixture(config: FailoverManagerConfig) -> Fixture {
        let driver = FakeDriver::new();
        let instances = Arc::new(InstanceRegistry::new());
        let pools = Arc::new(ConnectionPoolRegistry::new(driver.clone()));
        let clusters = Arc::new(ClusterRegistry::new());

        for (id, role) in [
            ("p", InstanceRole::Primary),
            ("r1", InstanceRole::Replica),
            ("r2", InstanceRole::Replica),
        ] {
            instances.register_database_instance(DatabaseInstance::new(id, id, 3306, role).with_id(id));
            set_health(&instances, id, 0, 10);
            pools
                .create_connection_pool(DatabaseConfig::new(id, 3306, "root", &PoolDefaults::default()))
                .await
                .unwrap();
        }
        clusters
            .create_database_cluster(
                DatabaseCluster::new("main", "p", vec!["r1".into(), "r2".into()]).with_id("c1"),
                &instances,
            )
            .unwrap();

        let manager = Arc::new(FailoverManager::new(
            config,
            instances.clone(),
            pools.clone(),
            clusters.clone(),
            Arc::new(QueryStats::new()),
        ));
        Fixture {
            driver,
            instances,
            pools,
            clusters,
            manager,
        }
    }

    async fn wait_until_finished(manager: &FailoverManager, cluster_id: &str) -> FailoverOperation {
        for _ in 0..200 {
            if !manager.check_failover_status(cluster_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manager.failover_operation(cluster_id).unwrap()
    }

    #[test]
    fn test_health_score_monotonic() {
        let base = health_score(&HealthCheck::success(Duration::from_millis(50)));
        let slower = health_score(&HealthCheck::success(Duration::from_millis(200)));
        let failing = health_score(&HealthCheck {
            consecutive_fails: 1,
            ..HealthCheck::success(Duration::from_millis(50))
        });
        assert!((base - 99.5).abs() < 1e-9);
        assert!(slower < base);
        assert!(failing < base);
    }

    #[tokio::test]
    async fn test_select_prefers_fastest_and_first_on_tie() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        let cluster = f.clusters.get_database_cluster("c1").unwrap();

        set_health(&f.instances, "r1", 0, 200);
        set_health(&f.instances, "r2", 0, 50);
        assert_eq!(select_new_primary(&cluster, &f.instances).unwrap().id, "r2");

        set_health(&f.instances, "r1", 0, 50);
        assert_eq!(select_new_primary(&cluster, &f.instances).unwrap().id, "r1");

        set_health(&f.instances, "r1", 2, 50);
        assert_eq!(select_new_primary(&cluster, &f.instances).unwrap().id, "r2");
    }

    #[tokio::test]
    async fn test_successful_failover() {
        let f = create_fixture(FailoverManagerConfig::default()).await;

        let op = f.manager.trigger_failover("c1").unwrap();
        assert_eq!(op.status, FailoverStatus::Initiated);
        assert_eq!(op.new_primary.id, "r1");
        assert!(f.clusters.get_database_cluster("c1").unwrap().health.failover_active);

        let op = wait_until_finished(&f.manager, "c1").await;
        assert_eq!(op.status, FailoverStatus::Completed);
        assert!(op.steps.iter().all(|s| s.status == FailoverStatus::Completed));
        assert!(op.duration.is_some());

        let cluster = f.clusters.get_database_cluster("c1").unwrap();
        assert_eq!(cluster.primary, "r1");
        // healthy old primary rejoins as a replica
        assert_eq!(cluster.replicas, vec!["r2".to_string(), "p".to_string()]);
        assert!(!cluster.health.failover_active);
        assert!(cluster.health.last_failover.is_some());

        assert!(f.instances.get_database_instance("r1").unwrap().is_primary());
        assert!(!f.instances.get_database_instance("p").unwrap().is_primary());

        let old = f.driver.server("p:3306");
        assert!(old.read_only.load(Ordering::SeqCst));
        let new = f.driver.server("r1:3306");
        assert!(!new.read_only.load(Ordering::SeqCst));
        assert!(new.executed().contains(&"SELECT 1".to_string()));

        // the old primary's pool keeps its ID but now serves r1
        let repointed: Vec<_> = f
            .pools
            .get_all_connection_pools()
            .into_iter()
            .filter(|p| p.database_id == "r1:3306")
            .collect();
        assert_eq!(repointed.len(), 2);
        assert_eq!(f.driver.handles()[0].target(), "r1:3306");
    }

    #[tokio::test]
    async fn test_unreachable_old_primary_is_dropped() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        f.driver.set_reachable("p:3306", false);
        set_health(&f.instances, "p", 5, 0);

        f.manager.trigger_failover("c1").unwrap();
        let op = wait_until_finished(&f.manager, "c1").await;
        assert_eq!(op.status, FailoverStatus::Completed);

        let cluster = f.clusters.get_database_cluster("c1").unwrap();
        assert_eq!(cluster.primary, "r1");
        assert_eq!(cluster.replicas, vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn test_second_trigger_rejected() {
        let f = create_fixture(FailoverManagerConfig::default()).await;

        f.manager.trigger_failover("c1").unwrap();
        let err = f.manager.trigger_failover("c1").unwrap_err();
        assert!(err.to_string().contains("already in progress"));
        assert_eq!(f.manager.failover_operations().len(), 1);

        wait_until_finished(&f.manager, "c1").await;
    }

    #[tokio::test]
    async fn test_no_healthy_replica() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        set_health(&f.instances, "r1", 1, 10);
        set_health(&f.instances, "r2", 3, 10);

        let err = f.manager.trigger_failover("c1").unwrap_err();
        assert_eq!(err.to_string(), "no healthy replica found for promotion");
        assert!(f.manager.failover_operations().is_empty());

        let cluster = f.clusters.get_database_cluster("c1").unwrap();
        assert_eq!(cluster.primary, "p");
        assert!(!cluster.health.failover_active);
    }

    #[tokio::test]
    async fn test_disabled_cluster_rejected() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        f.clusters
            .create_database_cluster(
                DatabaseCluster::new("frozen", "r1", vec!["r2".into()])
                    .with_id("c2")
                    .with_failover(crate::cluster::FailoverConfig {
                        enabled: false,
                        failure_threshold: 5,
                    }),
                &f.instances,
            )
            .unwrap();

        assert!(matches!(
            f.manager.trigger_failover("c2"),
            Err(FailoverError::Disabled(_))
        ));
        assert!(matches!(
            f.manager.trigger_failover("missing"),
            Err(FailoverError::Cluster(ClusterError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        f.driver.fail_on("r1:3306", "read_only = OFF");

        f.manager.trigger_failover("c1").unwrap();
        let op = wait_until_finished(&f.manager, "c1").await;

        assert_eq!(op.status, FailoverStatus::RolledBack);
        assert_eq!(op.current_step, 2);
        assert_eq!(op.steps[2].kind, StepKind::PromoteReplica);
        assert!(op.error.is_some());
        assert_eq!(op.steps[0].status, FailoverStatus::Completed);
        assert_eq!(op.steps[1].status, FailoverStatus::Completed);
        assert_eq!(op.steps[2].status, FailoverStatus::Failed);
        assert!(op.steps[3..]
            .iter()
            .all(|s| s.status == FailoverStatus::Initiated));

        let cluster = f.clusters.get_database_cluster("c1").unwrap();
        assert_eq!(cluster.primary, "p");
        assert!(!cluster.health.failover_active);

        // a terminal operation does not block a new attempt
        f.driver.server("r1:3306").fail_on.lock().take();
        f.manager.trigger_failover("c1").unwrap();
        let op = wait_until_finished(&f.manager, "c1").await;
        assert_eq!(op.status, FailoverStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_timeout_fails_operation() {
        let config = FailoverManagerConfig {
            replication_timeout_ms: 2000,
            ..FailoverManagerConfig::default()
        };
        let f = create_fixture(config).await;
        f.driver.set_lag("r1:3306", Some(Duration::from_secs(10)));

        f.manager.trigger_failover("c1").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let op = f.manager.failover_operation("c1").unwrap();
        assert_eq!(op.status, FailoverStatus::RolledBack);
        assert_eq!(op.steps[1].kind, StepKind::WaitReplication);
        assert_eq!(op.steps[1].status, FailoverStatus::Failed);
        assert!(op.steps[1]
            .error
            .as_deref()
            .unwrap()
            .contains("replication failed to catch up within"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_operations_returns_after_terminal_state() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        f.driver.set_lag("r1:3306", Some(Duration::from_secs(5)));
        f.manager.trigger_failover("c1").unwrap();

        let driver = f.driver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            driver.set_lag("r1:3306", None);
        });
        f.manager.wait_for_operations().await;

        assert!(!f.manager.check_failover_status("c1"));
        assert_eq!(
            f.manager.failover_operation("c1").unwrap().status,
            FailoverStatus::Completed
        );
        // Nothing left to wait for
        f.manager.wait_for_operations().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_replication_blocks_promotion() {
        let config = FailoverManagerConfig {
            replication_timeout_ms: 2000,
            ..FailoverManagerConfig::default()
        };
        let f = create_fixture(config).await;
        f.driver.set_replication_stopped("r1:3306", true);

        f.manager.trigger_failover("c1").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let op = f.manager.failover_operation("c1").unwrap();
        assert_eq!(op.status, FailoverStatus::RolledBack);
        assert_eq!(op.steps[1].status, FailoverStatus::Failed);
        assert!(op.steps[1]
            .error
            .as_deref()
            .unwrap()
            .contains("replication failed to catch up within"));
        assert_eq!(op.steps[2].status, FailoverStatus::Initiated);
        assert_eq!(f.clusters.get_database_cluster("c1").unwrap().primary, "p");
        assert!(f.driver.server("r1:3306").executed().iter().all(|sql| !sql.contains("read_only = OFF")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_wait_ends_when_lag_drops() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        f.driver.set_lag("r1:3306", Some(Duration::from_secs(3)));

        f.manager.trigger_failover("c1").unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.manager.check_failover_status("c1"));

        f.driver.set_lag("r1:3306", Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            f.manager.failover_operation("c1").unwrap().status,
            FailoverStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_scan_triggers_at_threshold() {
        let config = FailoverManagerConfig {
            auto_failover: true,
            ..FailoverManagerConfig::default()
        };
        let f = create_fixture(config).await;
        set_health(&f.instances, "r1", 0, 50);
        set_health(&f.instances, "r2", 0, 200);

        set_health(&f.instances, "p", 4, 0);
        assert!(f.manager.check_failover_conditions().is_empty());

        set_health(&f.instances, "p", 5, 0);
        assert_eq!(f.manager.check_failover_conditions(), vec!["c1".to_string()]);
        let op = wait_until_finished(&f.manager, "c1").await;
        assert_eq!(op.new_primary.id, "r1");
        assert_eq!(op.status, FailoverStatus::Completed);
    }

    #[tokio::test]
    async fn test_scan_respects_global_flag() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        set_health(&f.instances, "p", 10, 0);

        assert!(f.manager.check_failover_conditions().is_empty());
        f.manager.set_auto_failover(true);
        assert_eq!(f.manager.check_failover_conditions().len(), 1);
        wait_until_finished(&f.manager, "c1").await;
    }

    #[tokio::test]
    async fn test_purge_removes_finished_operations() {
        let config = FailoverManagerConfig {
            retention_ms: 0,
            ..FailoverManagerConfig::default()
        };
        let f = create_fixture(config).await;

        f.manager.trigger_failover("c1").unwrap();
        // in-flight operations survive a purge
        assert_eq!(f.manager.purge_expired(), 0);
        wait_until_finished(&f.manager, "c1").await;

        assert_eq!(f.manager.purge_expired(), 1);
        assert!(f.manager.failover_operations().is_empty());
        assert!(matches!(
            f.manager.failover_operation("c1"),
            Err(FailoverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let f = create_fixture(FailoverManagerConfig::default()).await;
        let shutdown = CancellationToken::new();

        f.manager.start_monitoring(&shutdown).unwrap();
        assert!(f.manager.is_monitoring());
        assert!(matches!(
            f.manager.start_monitoring(&shutdown),
            Err(FailoverError::AlreadyRunning)
        ));
        f.manager.stop_monitoring();
        f.manager.stop_monitoring();
        assert!(!f.manager.is_monitoring());
    }
}
