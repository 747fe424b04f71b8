//! Failover operation and step records

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::instance::DatabaseInstance;

/// Lifecycle of an operation or a single step
///
/// Operations move `Initiated -> Running -> Completed | Failed -> RolledBack`;
/// steps stop at `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    Initiated,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl FailoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverStatus::Initiated => "initiated",
            FailoverStatus::Running => "running",
            FailoverStatus::Completed => "completed",
            FailoverStatus::Failed => "failed",
            FailoverStatus::RolledBack => "rolled_back",
        }
    }

    /// Still owns the cluster
    pub fn is_in_flight(&self) -> bool {
        matches!(self, FailoverStatus::Initiated | FailoverStatus::Running)
    }
}

/// The stages of a promotion, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    StopWrites,
    WaitReplication,
    PromoteReplica,
    UpdateConnections,
    VerifyPrimary,
    UpdateCluster,
}

impl StepKind {
    pub const ALL: [StepKind; 6] = [
        StepKind::StopWrites,
        StepKind::WaitReplication,
        StepKind::PromoteReplica,
        StepKind::UpdateConnections,
        StepKind::VerifyPrimary,
        StepKind::UpdateCluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::StopWrites => "stop_writes",
            StepKind::WaitReplication => "wait_replication",
            StepKind::PromoteReplica => "promote_replica",
            StepKind::UpdateConnections => "update_connections",
            StepKind::VerifyPrimary => "verify_primary",
            StepKind::UpdateCluster => "update_cluster",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StepKind::StopWrites => "Stop writes to the current primary",
            StepKind::WaitReplication => "Wait for the candidate to catch up",
            StepKind::PromoteReplica => "Promote the candidate to primary",
            StepKind::UpdateConnections => "Repoint connection pools to the new primary",
            StepKind::VerifyPrimary => "Verify the new primary accepts queries",
            StepKind::UpdateCluster => "Record the new topology on the cluster",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverStep {
    pub kind: StepKind,
    pub description: String,
    pub status: FailoverStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

impl FailoverStep {
    fn new(kind: StepKind) -> Self {
        Self {
            kind,
            description: kind.description().to_string(),
            status: FailoverStatus::Initiated,
            started_at: None,
            ended_at: None,
            duration: None,
            error: None,
        }
    }

    fn finish(&mut self, status: FailoverStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.ended_at = Some(now);
        self.duration = self
            .started_at
            .and_then(|started| (now - started).to_std().ok());
    }
}

/// A promotion in progress or recently finished, keyed by cluster
#[derive(Debug, Clone, Serialize)]
pub struct FailoverOperation {
    pub cluster_id: String,
    pub started_at: DateTime<Utc>,
    pub status: FailoverStatus,
    /// Snapshot of the primary being replaced, taken at trigger time
    pub old_primary: DatabaseInstance,
    /// Snapshot of the promotion candidate, taken at trigger time
    pub new_primary: DatabaseInstance,
    pub steps: Vec<FailoverStep>,
    pub current_step: usize,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl FailoverOperation {
    pub fn new(
        cluster_id: impl Into<String>,
        old_primary: DatabaseInstance,
        new_primary: DatabaseInstance,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            started_at: Utc::now(),
            status: FailoverStatus::Initiated,
            old_primary,
            new_primary,
            steps: StepKind::ALL.iter().copied().map(FailoverStep::new).collect(),
            current_step: 0,
            error: None,
            completed_at: None,
            duration: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }

    pub(crate) fn begin(&mut self) {
        self.status = FailoverStatus::Running;
    }

    pub(crate) fn start_step(&mut self, idx: usize) {
        self.current_step = idx;
        let step = &mut self.steps[idx];
        step.status = FailoverStatus::Running;
        step.started_at = Some(Utc::now());
    }

    pub(crate) fn complete_step(&mut self, idx: usize) {
        self.steps[idx].finish(FailoverStatus::Completed, None);
    }

    /// Fail the step and the operation; later steps stay `Initiated`
    pub(crate) fn fail_step(&mut self, idx: usize, error: String) {
        self.steps[idx].finish(FailoverStatus::Failed, Some(error.clone()));
        self.status = FailoverStatus::Failed;
        self.error = Some(error);
        self.stamp_end();
    }

    /// Label a failed operation as rolled back; nothing is compensated
    pub(crate) fn roll_back(&mut self) {
        if self.status == FailoverStatus::Failed {
            self.status = FailoverStatus::RolledBack;
        }
    }

    pub(crate) fn complete(&mut self) {
        self.status = FailoverStatus::Completed;
        self.stamp_end();
    }

    fn stamp_end(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration = (now - self.started_at).to_std().ok();
    }

    /// Finished before `cutoff`
    pub(crate) fn expired(&self, cutoff: DateTime<Utc>) -> bool {
        !self.is_in_flight() && self.completed_at.is_some_and(|at| at <= cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceRole;

    fn create_operation() -> FailoverOperation {
        FailoverOperation::new(
            "c1",
            DatabaseInstance::new("p", "p", 3306, InstanceRole::Primary).with_id("p"),
            DatabaseInstance::new("r1", "r1", 3306, InstanceRole::Replica).with_id("r1"),
        )
    }

    #[test]
    fn test_new_operation_has_ordered_steps() {
        let op = create_operation();
        assert_eq!(op.status, FailoverStatus::Initiated);
        assert!(op.is_in_flight());
        let kinds: Vec<_> = op.steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StepKind::ALL.to_vec());
        assert!(op.steps.iter().all(|s| s.status == FailoverStatus::Initiated));
    }

    #[test]
    fn test_failed_step_leaves_later_steps_untouched() {
        let mut op = create_operation();
        op.begin();
        op.start_step(0);
        op.complete_step(0);
        op.start_step(1);
        op.fail_step(1, "boom".into());

        assert_eq!(op.status, FailoverStatus::Failed);
        assert_eq!(op.current_step, 1);
        assert_eq!(op.steps[0].status, FailoverStatus::Completed);
        assert_eq!(op.steps[1].status, FailoverStatus::Failed);
        assert_eq!(op.steps[1].error.as_deref(), Some("boom"));
        assert!(op.steps[2..]
            .iter()
            .all(|s| s.status == FailoverStatus::Initiated && s.started_at.is_none()));
        assert!(op.completed_at.is_some());

        op.roll_back();
        assert_eq!(op.status, FailoverStatus::RolledBack);
        assert!(!op.is_in_flight());
    }

    #[test]
    fn test_roll_back_only_applies_to_failed() {
        let mut op = create_operation();
        op.begin();
        op.roll_back();
        assert_eq!(op.status, FailoverStatus::Running);
    }

    #[test]
    fn test_expiry_requires_terminal_status() {
        let mut op = create_operation();
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(!op.expired(later));

        op.begin();
        op.complete();
        assert!(op.expired(later));
        assert!(!op.expired(Utc::now() - chrono::Duration::hours(1)));
    }

    #[test]
    fn test_step_kind_serializes_as_name() {
        let json = serde_json::to_value(StepKind::WaitReplication).unwrap();
        assert_eq!(json, "wait_replication");
        let json = serde_json::to_value(FailoverStatus::RolledBack).unwrap();
        assert_eq!(json, "rolled_back");
    }
}
