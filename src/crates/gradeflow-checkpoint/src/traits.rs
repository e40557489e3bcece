//! The `Checkpointer` storage trait.

use crate::error::Result;
use crate::types::{RunIndexRecord, RunStatus, StateSnapshot};
use async_trait::async_trait;
use serde_json::Value;

/// Storage backend for run snapshots.
///
/// Implementations must be `Send + Sync` and must serialize concurrent
/// writes for the same `batch_id` (writes for different runs may proceed in
/// parallel). The contract is append-oriented: `save` never overwrites an
/// existing snapshot, it assigns the next sequence number and returns it.
///
/// # Failure semantics
///
/// Callers treat `save` failures as non-fatal: the run continues without
/// resumability from that point. Backends should therefore fail fast rather
/// than block graph execution on a slow store.
#[async_trait]
pub trait Checkpointer: std::marker::Send + Sync {
    /// Persist a snapshot taken after `node_name` completed. Returns the
    /// assigned sequence number.
    async fn save(
        &self,
        batch_id: &str,
        node_name: &str,
        attempt: u32,
        state: Value,
    ) -> Result<u64>;

    /// Latest snapshot for a run, or `None` if the run is unknown.
    async fn load_latest(&self, batch_id: &str) -> Result<Option<StateSnapshot>>;

    /// Index records for runs, optionally filtered by status.
    async fn list_active(&self, status: Option<RunStatus>) -> Result<Vec<RunIndexRecord>>;

    /// Update the run's index record (status and current stage).
    async fn update_status(&self, batch_id: &str, status: RunStatus, stage: &str) -> Result<()>;

    /// Remove all snapshots and the index record for a run.
    async fn delete_run(&self, batch_id: &str) -> Result<()>;
}
