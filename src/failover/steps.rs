//! Execution of individual failover steps

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, ClusterRegistry};
use crate::config::{FailoverManagerConfig, InstanceRole};
use crate::driver::{DbHandle, DriverError};
use crate::health::probe_handle;
use crate::instance::{DatabaseInstance, HealthCheck, InstanceError, InstanceRegistry};
use crate::pool::ConnectionPoolRegistry;

use super::operation::StepKind;

/// Why a step failed
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("replication failed to catch up within {0:?}")]
    ReplicationTimeout(Duration),

    #[error("no connection pool found for {0}")]
    NoPool(String),

    #[error("{addr}: {source}")]
    Driver {
        addr: String,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Everything a step needs to act on one promotion
pub(crate) struct StepContext<'a> {
    pub config: &'a FailoverManagerConfig,
    pub instances: &'a InstanceRegistry,
    pub pools: &'a ConnectionPoolRegistry,
    pub clusters: &'a ClusterRegistry,
    pub cluster_id: &'a str,
    pub old_primary: &'a DatabaseInstance,
    pub new_primary: &'a DatabaseInstance,
}

impl StepContext<'_> {
    pub async fn run(&self, kind: StepKind) -> Result<(), StepError> {
        match kind {
            StepKind::StopWrites => self.stop_writes().await,
            StepKind::WaitReplication => self.wait_replication().await,
            StepKind::PromoteReplica => self.promote_replica().await,
            StepKind::UpdateConnections => {
                self.update_connections();
                Ok(())
            }
            StepKind::VerifyPrimary => self.verify_primary().await,
            StepKind::UpdateCluster => self.update_cluster(),
        }
    }

    fn handle_for(&self, instance: &DatabaseInstance) -> Option<Arc<dyn DbHandle>> {
        self.pools
            .find_by_database_id(&instance.addr())
            .map(|pool| pool.handle)
    }

    fn require_handle(&self, instance: &DatabaseInstance) -> Result<Arc<dyn DbHandle>, StepError> {
        self.handle_for(instance)
            .ok_or_else(|| StepError::NoPool(instance.addr()))
    }

    async fn bounded<T, F>(&self, addr: &str, fut: F) -> Result<T, StepError>
    where
        F: std::future::Future<Output = Result<T, DriverError>>,
    {
        let limit = self.config.step_timeout();
        let result = match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(limit)),
        };
        result.map_err(|source| StepError::Driver {
            addr: addr.to_string(),
            source,
        })
    }

    /// Fence the old primary; an unreachable server counts as fenced
    async fn stop_writes(&self) -> Result<(), StepError> {
        let addr = self.old_primary.addr();
        let Some(handle) = self.handle_for(self.old_primary) else {
            warn!(cluster_id = %self.cluster_id, addr = %addr, "No pool for old primary, treating as fenced");
            return Ok(());
        };

        match self.bounded(&addr, handle.set_read_only(true)).await {
            Ok(()) => {
                info!(cluster_id = %self.cluster_id, addr = %addr, "Old primary set read-only");
                Ok(())
            }
            Err(StepError::Driver { source, .. }) if source.is_unreachable() => {
                warn!(
                    cluster_id = %self.cluster_id,
                    addr = %addr,
                    error = %source,
                    "Old primary unreachable, treating as fenced"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Poll the candidate until its lag drops below the acceptable bound
    async fn wait_replication(&self) -> Result<(), StepError> {
        let addr = self.new_primary.addr();
        let handle = self.require_handle(self.new_primary)?;
        let acceptable = self.config.acceptable_lag();
        let poll_interval = self.config.replication_poll_interval();
        let replication_timeout = self.config.replication_timeout();

        let wait = async {
            loop {
                match self.bounded(&addr, handle.replication_lag()).await {
                    Ok(None) => return,
                    Ok(Some(lag)) if lag < acceptable => return,
                    Ok(Some(lag)) => {
                        debug!(addr = %addr, lag_ms = lag.as_millis() as u64, "Candidate still lagging");
                    }
                    // Stopped replication and failed checks keep the step waiting
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "Replication lag check failed");
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        timeout(replication_timeout, wait)
            .await
            .map_err(|_| StepError::ReplicationTimeout(replication_timeout))?;
        info!(cluster_id = %self.cluster_id, addr = %addr, "Candidate caught up with replication");
        Ok(())
    }

    async fn promote_replica(&self) -> Result<(), StepError> {
        self.instances
            .set_role(&self.old_primary.id, InstanceRole::Replica)?;
        self.instances
            .set_role(&self.new_primary.id, InstanceRole::Primary)?;

        let addr = self.new_primary.addr();
        let handle = self.require_handle(self.new_primary)?;
        self.bounded(&addr, handle.set_read_only(false)).await?;
        info!(cluster_id = %self.cluster_id, addr = %addr, "Candidate promoted to primary");
        Ok(())
    }

    fn update_connections(&self) {
        let repointed = self.pools.repoint(
            &self.old_primary.addr(),
            &self.new_primary.host,
            self.new_primary.port,
        );
        info!(
            cluster_id = %self.cluster_id,
            pools = repointed.len(),
            "Connection pools now target the new primary"
        );
    }

    async fn verify_primary(&self) -> Result<(), StepError> {
        let addr = self.new_primary.addr();
        let handle = self.require_handle(self.new_primary)?;
        let response_time = probe_handle(handle.as_ref(), self.config.step_timeout(), true)
            .await
            .map_err(|source| StepError::Driver {
                addr: addr.clone(),
                source,
            })?;

        self.instances
            .update_instance_health(&self.new_primary.id, HealthCheck::success(response_time))?;
        Ok(())
    }

    fn update_cluster(&self) -> Result<(), StepError> {
        let keep_old_primary = self
            .instances
            .get_database_instance(&self.old_primary.id)
            .map(|instance| instance.is_healthy())
            .unwrap_or(false);
        self.clusters
            .apply_failover(self.cluster_id, &self.new_primary.id, keep_old_primary)?;
        Ok(())
    }
}
