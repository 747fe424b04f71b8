//! Instance and health state definitions

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::InstanceRole;

/// Health status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Reachable with no outstanding failures
    Healthy,
    /// Last probe failed or failures have not cleared yet
    Unhealthy,
    /// Not probed yet
    #[default]
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Unknown => "unknown",
        }
    }
}

/// Result of the most recent probe of an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthCheck {
    pub is_connected: bool,
    pub consecutive_fails: u32,
    pub response_time: Duration,
    pub last_error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
    pub active_conns: usize,
    pub idle_conns: usize,
    pub waiting_conns: u64,
}

impl HealthCheck {
    /// A successful probe; clears the failure streak
    pub fn success(response_time: Duration) -> Self {
        Self {
            is_connected: true,
            consecutive_fails: 0,
            response_time,
            last_error: None,
            checked_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// A failed probe following `previous`
    pub fn failure(previous: &HealthCheck, error: impl Into<String>, response_time: Duration) -> Self {
        Self {
            is_connected: false,
            consecutive_fails: previous.consecutive_fails.saturating_add(1),
            response_time,
            last_error: Some(error.into()),
            checked_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Status implied by this check
    pub fn status(&self) -> InstanceStatus {
        if self.is_connected && self.consecutive_fails == 0 {
            InstanceStatus::Healthy
        } else {
            InstanceStatus::Unhealthy
        }
    }
}

/// A database server known to the HA layer
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInstance {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub role: InstanceRole,
    pub status: InstanceStatus,
    pub health: HealthCheck,
    pub last_checked: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl DatabaseInstance {
    /// A new, not yet probed instance; the registry assigns the ID when empty
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, role: InstanceRole) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            host: host.into(),
            port,
            role,
            status: InstanceStatus::Unknown,
            health: HealthCheck::default(),
            last_checked: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy && self.health.is_connected
    }

    pub fn is_primary(&self) -> bool {
        self.role == InstanceRole::Primary
    }
}
