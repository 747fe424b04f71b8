//! Automatic and manual primary failover
//!
//! A [`FailoverManager`] scans clusters for a primary that has failed too
//! many consecutive probes, picks the best healthy replica and drives a
//! [`FailoverOperation`] through its [`StepKind`]s in order. A failing step
//! ends the operation; rollback only relabels it.

mod manager;
mod operation;
mod steps;

pub use manager::{health_score, select_new_primary, FailoverError, FailoverManager};
pub use operation::{FailoverOperation, FailoverStatus, FailoverStep, StepKind};
pub use steps::StepError;
