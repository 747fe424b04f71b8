use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// One statement run inside a transaction
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub sql: String,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Outcome of [`HaService::execute_transaction`](super::HaService::execute_transaction)
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub status: TransactionStatus,
    pub queries: Vec<QueryRecord>,
    pub error: Option<String>,
}

impl Transaction {
    pub(crate) fn begin() -> Self {
        Self {
            id: format!("txn_{}", Uuid::new_v4().simple()),
            started_at: Utc::now(),
            ended_at: None,
            duration: None,
            status: TransactionStatus::Active,
            queries: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, status: TransactionStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.ended_at = Some(now);
        self.duration = (now - self.started_at).to_std().ok();
    }

    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }
}
