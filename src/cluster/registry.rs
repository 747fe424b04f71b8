use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::instance::{InstanceRegistry, InstanceStatus};
use crate::pool::ConnectionPoolRegistry;

use super::state::{ClusterHealth, DatabaseCluster};

/// Cluster registry errors
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("database cluster not found: {0}")]
    NotFound(String),

    #[error("cluster member is not a registered instance: {0}")]
    UnknownInstance(String),

    #[error("invalid cluster: {0}")]
    Invalid(String),
}

#[derive(Default)]
pub struct ClusterRegistry {
    clusters: DashMap<String, DatabaseCluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cluster after checking its members are registered instances
    pub fn create_database_cluster(
        &self,
        mut cluster: DatabaseCluster,
        instances: &InstanceRegistry,
    ) -> Result<DatabaseCluster, ClusterError> {
        if cluster.primary.is_empty() {
            return Err(ClusterError::Invalid("primary is required".into()));
        }
        if cluster.replicas.iter().any(|r| *r == cluster.primary) {
            return Err(ClusterError::Invalid(format!(
                "{} is listed as both primary and replica",
                cluster.primary
            )));
        }
        let mut seen = HashSet::new();
        for member in cluster.members() {
            if !seen.insert(member) {
                return Err(ClusterError::Invalid(format!("duplicate member {}", member)));
            }
            if !instances.contains(member) {
                return Err(ClusterError::UnknownInstance(member.to_string()));
            }
        }

        if cluster.id.is_empty() {
            cluster.id = format!("cluster_{}", Uuid::new_v4().simple());
        }
        let now = Utc::now();
        cluster.created_at = now;
        cluster.updated_at = now;

        info!(
            cluster_id = %cluster.id,
            primary = %cluster.primary,
            replicas = cluster.replicas.len(),
            failover_enabled = cluster.failover.enabled,
            "Created database cluster"
        );
        self.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    pub fn get_database_cluster(&self, id: &str) -> Result<DatabaseCluster, ClusterError> {
        self.clusters
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))
    }

    /// All clusters sorted by ID
    pub fn get_all_clusters(&self) -> Vec<DatabaseCluster> {
        let mut clusters: Vec<DatabaseCluster> =
            self.clusters.iter().map(|entry| entry.value().clone()).collect();
        clusters.sort_by(|a, b| a.id.cmp(&b.id));
        clusters
    }

    /// Compute the current health of a cluster without storing it
    pub fn get_cluster_health(
        &self,
        id: &str,
        instances: &InstanceRegistry,
        pools: &ConnectionPoolRegistry,
    ) -> Result<ClusterHealth, ClusterError> {
        let cluster = self.get_database_cluster(id)?;
        Ok(compute_health(&cluster, instances, pools))
    }

    /// Compute and store the health of a cluster
    pub fn update_cluster_health(
        &self,
        id: &str,
        instances: &InstanceRegistry,
        pools: &ConnectionPoolRegistry,
    ) -> Result<ClusterHealth, ClusterError> {
        // Computed under the entry lock so a concurrent primary swap cannot
        // leave health describing the previous topology
        let mut entry = self
            .clusters
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        let health = compute_health(&entry, instances, pools);
        if entry.health.status != health.status {
            info!(
                cluster_id = %id,
                status = health.status.as_str(),
                primary_healthy = health.primary_healthy,
                "Cluster status changed"
            );
        }
        entry.health = health.clone();
        Ok(health)
    }

    pub fn set_failover_active(&self, id: &str, active: bool) -> Result<(), ClusterError> {
        let mut entry = self
            .clusters
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        entry.health.failover_active = active;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Swap the primary after a promotion
    ///
    /// The new primary leaves the replica list; the old primary joins it only
    /// when `keep_old_primary` is set.
    pub fn apply_failover(
        &self,
        id: &str,
        new_primary: &str,
        keep_old_primary: bool,
    ) -> Result<DatabaseCluster, ClusterError> {
        let mut entry = self
            .clusters
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;

        let old_primary = std::mem::replace(&mut entry.primary, new_primary.to_string());
        entry.replicas.retain(|r| r != new_primary && *r != old_primary);
        if keep_old_primary {
            entry.replicas.push(old_primary.clone());
        }

        let now = Utc::now();
        entry.health.last_failover = Some(now);
        entry.health.failover_active = false;
        entry.updated_at = now;

        info!(
            cluster_id = %id,
            old_primary = %old_primary,
            new_primary = %new_primary,
            kept_old_primary = keep_old_primary,
            "Cluster primary swapped"
        );
        Ok(entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

fn compute_health(
    cluster: &DatabaseCluster,
    instances: &InstanceRegistry,
    pools: &ConnectionPoolRegistry,
) -> ClusterHealth {
    let is_healthy = |id: &str| {
        instances
            .get_database_instance(id)
            .map(|instance| instance.is_healthy())
            .unwrap_or(false)
    };

    let primary_healthy = is_healthy(cluster.primary.as_str());
    let replicas_healthy = cluster.replicas.iter().filter(|r| is_healthy(r.as_str())).count();

    let member_addrs: HashSet<String> = cluster
        .members()
        .filter_map(|id| instances.get_database_instance(id).ok())
        .map(|instance| instance.addr())
        .collect();
    let member_pools: Vec<_> = pools
        .get_all_connection_pools()
        .into_iter()
        .filter(|pool| member_addrs.contains(&pool.database_id))
        .collect();

    let health = ClusterHealth {
        status: if primary_healthy {
            InstanceStatus::Healthy
        } else {
            InstanceStatus::Unhealthy
        },
        primary_healthy,
        replicas_healthy,
        total_replicas: cluster.replicas.len(),
        connection_pools: member_pools.len(),
        total_connections: member_pools
            .iter()
            .map(|pool| pool.stats.open_connections)
            .sum(),
        last_failover: cluster.health.last_failover,
        failover_active: cluster.health.failover_active,
        checked_at: Some(Utc::now()),
    };
    debug!(
        cluster_id = %cluster.id,
        primary_healthy,
        replicas_healthy,
        "Computed cluster health"
    );
    health
}
