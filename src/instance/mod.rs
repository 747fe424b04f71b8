//! Database instance tracking
//!
//! This module provides:
//! - Instance records with role, status and the latest health check
//! - A concurrent registry that derives status from health updates

mod registry;
mod state;

pub use registry::{InstanceError, InstanceRegistry, StatusCounts};
pub use state::{DatabaseInstance, HealthCheck, InstanceStatus};
