//! Snapshot and run-index records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a run as seen by the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    /// Whether the run can still make progress.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running | RunStatus::Paused)
    }
}

/// One persisted state snapshot, taken at a node boundary.
///
/// Snapshots for a run form a monotone sequence; `sequence` is assigned by
/// the backend and strictly increases per `batch_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Run identifier.
    pub batch_id: String,

    /// Monotone sequence number within the run.
    pub sequence: u64,

    /// Node that completed immediately before this snapshot was taken.
    pub node_name: String,

    /// Attempt number of that node execution.
    pub attempt: u32,

    /// Full serialized grading state.
    pub state: Value,

    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// Per-run index record supporting `list_active` queries without loading
/// snapshot payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexRecord {
    pub batch_id: String,
    pub latest_sequence: u64,
    pub current_stage: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
