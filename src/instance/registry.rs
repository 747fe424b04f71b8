//! Registry of database instances
//!
//! Instances are stored by ID and handed out as copies. Health fields are
//! only written through `update_instance_health`, which is also the only
//! place the status is derived.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::InstanceRole;

use super::state::{DatabaseInstance, HealthCheck, InstanceStatus};

/// Instance registry errors
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("database instance not found: {0}")]
    NotFound(String),
}

/// Counts of instances per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.healthy + self.unhealthy + self.unknown
    }
}

#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, DatabaseInstance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an instance, assigning a `db_` ID when it has none
    pub fn register_database_instance(&self, mut instance: DatabaseInstance) -> DatabaseInstance {
        if instance.id.is_empty() {
            instance.id = format!("db_{}", Uuid::new_v4().simple());
        }
        instance.last_checked = Utc::now();

        if self.instances.contains_key(&instance.id) {
            warn!(instance_id = %instance.id, "Replacing registered database instance");
        }
        info!(
            instance_id = %instance.id,
            addr = %instance.addr(),
            role = %instance.role,
            "Registered database instance"
        );

        self.instances.insert(instance.id.clone(), instance.clone());
        instance
    }

    pub fn get_database_instance(&self, id: &str) -> Result<DatabaseInstance, InstanceError> {
        self.instances
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))
    }

    /// All instances sorted by ID
    pub fn get_all_database_instances(&self) -> Vec<DatabaseInstance> {
        let mut instances: Vec<DatabaseInstance> =
            self.instances.iter().map(|entry| entry.value().clone()).collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Overwrite the health of an instance and derive its status
    pub fn update_instance_health(
        &self,
        id: &str,
        health: HealthCheck,
    ) -> Result<DatabaseInstance, InstanceError> {
        self.store_health(id, |_| health)
    }

    /// Record a failed health check, extending the failure streak held by the
    /// registry at write time
    pub fn record_check_failure(
        &self,
        id: &str,
        error: impl Into<String>,
        response_time: Duration,
    ) -> Result<DatabaseInstance, InstanceError> {
        let error = error.into();
        self.store_health(id, |current| HealthCheck::failure(current, error, response_time))
    }

    fn store_health(
        &self,
        id: &str,
        next: impl FnOnce(&HealthCheck) -> HealthCheck,
    ) -> Result<DatabaseInstance, InstanceError> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;

        let previous = entry.status;
        let health = next(&entry.health);
        let status = health.status();
        entry.status = status;
        entry.health = health;
        entry.last_checked = Utc::now();
        let snapshot = entry.value().clone();
        drop(entry);

        if previous != status {
            match status {
                InstanceStatus::Healthy => info!(
                    instance_id = %id,
                    addr = %snapshot.addr(),
                    from = previous.as_str(),
                    "Instance status changed"
                ),
                _ => warn!(
                    instance_id = %id,
                    addr = %snapshot.addr(),
                    from = previous.as_str(),
                    to = status.as_str(),
                    consecutive_fails = snapshot.health.consecutive_fails,
                    error = snapshot.health.last_error.as_deref().unwrap_or(""),
                    "Instance status changed"
                ),
            }
        } else {
            debug!(instance_id = %id, status = status.as_str(), "Instance health updated");
        }

        Ok(snapshot)
    }

    /// Change the role of an instance (failover promotion/demotion only)
    pub fn set_role(&self, id: &str, role: InstanceRole) -> Result<(), InstanceError> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;
        if entry.role != role {
            info!(instance_id = %id, from = %entry.role, to = %role, "Instance role changed");
            entry.role = role;
        }
        Ok(())
    }

    pub fn remove_database_instance(&self, id: &str) -> Result<DatabaseInstance, InstanceError> {
        let (_, instance) = self
            .instances
            .remove(id)
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))?;
        info!(instance_id = %id, addr = %instance.addr(), "Removed database instance");
        Ok(instance)
    }

    /// First instance (by ID) listening on `addr`
    pub fn find_by_addr(&self, addr: &str) -> Option<DatabaseInstance> {
        self.get_all_database_instances()
            .into_iter()
            .find(|instance| instance.addr() == addr)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.instances.iter() {
            match entry.status {
                InstanceStatus::Healthy => counts.healthy += 1,
                InstanceStatus::Unhealthy => counts.unhealthy += 1,
                InstanceStatus::Unknown => counts.unknown += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
