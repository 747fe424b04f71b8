use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cluster::ClusterHealth;
use crate::instance::{DatabaseInstance, HealthCheck};
use crate::pool::PoolStats;

/// Snapshot of instance, pool and cluster health
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    /// Healthy instances as a percentage of all instances; 0 without instances
    pub overall_health_score: f64,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub total_pools: usize,
    pub total_clusters: usize,
    pub instances: BTreeMap<String, HealthCheck>,
    pub pools: BTreeMap<String, PoolStats>,
    pub clusters: BTreeMap<String, ClusterHealth>,
}

impl HealthReport {
    pub fn build(
        instances: &[DatabaseInstance],
        pools: BTreeMap<String, PoolStats>,
        clusters: BTreeMap<String, ClusterHealth>,
    ) -> Self {
        let healthy_instances = instances.iter().filter(|i| i.is_healthy()).count();
        let overall_health_score = if instances.is_empty() {
            0.0
        } else {
            healthy_instances as f64 / instances.len() as f64 * 100.0
        };

        Self {
            generated_at: Utc::now(),
            overall_health_score,
            total_instances: instances.len(),
            healthy_instances,
            total_pools: pools.len(),
            total_clusters: clusters.len(),
            instances: instances
                .iter()
                .map(|i| (i.id.clone(), i.health.clone()))
                .collect(),
            pools,
            clusters,
        }
    }
}
