use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::instance::InstanceStatus;

/// Per-cluster failover policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailoverConfig {
    /// Allow failover for this cluster at all
    pub enabled: bool,
    /// Consecutive primary probe failures before automatic failover
    pub failure_threshold: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
        }
    }
}

/// Aggregated health of a cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterHealth {
    pub status: InstanceStatus,
    pub primary_healthy: bool,
    pub replicas_healthy: usize,
    pub total_replicas: usize,
    /// Pools serving a member of the cluster
    pub connection_pools: usize,
    /// Open connections across those pools
    pub total_connections: usize,
    pub last_failover: Option<DateTime<Utc>>,
    pub failover_active: bool,
    pub checked_at: Option<DateTime<Utc>>,
}

/// A primary with an ordered list of replicas
///
/// Members are instance IDs; resolve them through the instance registry.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseCluster {
    pub id: String,
    pub name: String,
    pub primary: String,
    pub replicas: Vec<String>,
    pub failover: FailoverConfig,
    pub health: ClusterHealth,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseCluster {
    pub fn new(name: impl Into<String>, primary: impl Into<String>, replicas: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            primary: primary.into(),
            replicas,
            failover: FailoverConfig::default(),
            health: ClusterHealth::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_failover(mut self, failover: FailoverConfig) -> Self {
        self.failover = failover;
        self
    }

    /// Primary followed by the replicas
    pub fn members(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.replicas.iter().map(String::as_str))
    }
}
