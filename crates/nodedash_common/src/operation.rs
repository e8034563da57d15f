//! Persisted operation records and the staleness rule shared by the janitor
//! and the display path.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Age beyond which a non-terminal operation is considered abandoned
pub const STALE_AFTER_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "in_progress" => Some(OperationStatus::InProgress),
            "succeeded" => Some(OperationStatus::Succeeded),
            "failed" => Some(OperationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }

    /// Statuses the janitor may reclaim
    pub const RECLAIMABLE: [OperationStatus; 2] =
        [OperationStatus::Pending, OperationStatus::InProgress];
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    /// What the operation does, e.g. "container-start"
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl OperationRecord {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            created_at: Utc::now(),
            status: OperationStatus::Pending,
            message: String::new(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    /// Status as it should be presented at `now`.
    ///
    /// A non-terminal record past the threshold is shown as failed even if the
    /// janitor has not reached it yet.
    pub fn effective_status(&self, now: DateTime<Utc>, threshold: Duration) -> OperationStatus {
        if is_stale(self.status, self.created_at, now, threshold) {
            OperationStatus::Failed
        } else {
            self.status
        }
    }
}

pub fn stale_threshold() -> Duration {
    Duration::seconds(STALE_AFTER_SECS)
}

/// Oldest `created_at` that is still considered fresh at `now`
pub fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    now - threshold
}

pub fn is_stale(
    status: OperationStatus,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    !status.is_terminal() && created_at < stale_cutoff(now, threshold)
}
