//! Health checking for registered instances and pools
//!
//! This module provides:
//! - Periodic probes of every instance through the pool serving its address
//! - Pool statistics refresh with utilization and wait warnings
//! - Cluster health aggregation after each round
//! - On-demand health reports

mod checker;
mod report;

pub use checker::{probe_handle, HealthChecker, HealthError};
pub use report::HealthReport;
