//! In-memory checkpoint storage for development and testing.
//!
//! Reference implementation of [`Checkpointer`] backed by a thread-safe map.
//! Snapshot state goes through the configured [`SnapshotSerializer`] on the
//! way in and out, exactly as a database-backed backend would store it, so
//! the codec path is exercised even in tests. Snapshots live only as long
//! as the process; use it for tests, local development, and short-lived
//! runs. A `tokio::sync::RwLock` around the whole map serializes writes per
//! run (and, conservatively, across runs; snapshot appends are cheap enough
//! that finer-grained locking has not been worth it).

use crate::error::{CheckpointError, Result};
use crate::serializer::{JsonSerializer, SnapshotSerializer};
use crate::traits::Checkpointer;
use crate::types::{RunIndexRecord, RunStatus, StateSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One snapshot as stored: metadata plus the encoded state payload.
#[derive(Debug)]
struct StoredSnapshot {
    sequence: u64,
    node_name: String,
    attempt: u32,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RunRecord {
    snapshots: Vec<StoredSnapshot>,
    index: RunIndexRecord,
}

/// Ephemeral, thread-safe checkpoint store.
#[derive(Clone)]
pub struct InMemoryCheckpointer {
    runs: Arc<RwLock<HashMap<String, RunRecord>>>,
    serializer: Arc<dyn SnapshotSerializer>,
}

impl Default for InMemoryCheckpointer {
    fn default() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            serializer: Arc::new(JsonSerializer::new()),
        }
    }
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot codec.
    pub fn with_serializer(mut self, serializer: Arc<dyn SnapshotSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Number of snapshots stored for a run. Test helper.
    pub async fn snapshot_count(&self, batch_id: &str) -> usize {
        let runs = self.runs.read().await;
        runs.get(batch_id).map_or(0, |r| r.snapshots.len())
    }

    /// Drop everything. Test isolation helper.
    pub async fn clear(&self) {
        self.runs.write().await.clear();
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(
        &self,
        batch_id: &str,
        node_name: &str,
        attempt: u32,
        state: Value,
    ) -> Result<u64> {
        let payload = self.serializer.dumps(&state)?;
        let mut runs = self.runs.write().await;
        let now = Utc::now();
        let record = runs.entry(batch_id.to_string()).or_insert_with(|| RunRecord {
            snapshots: Vec::new(),
            index: RunIndexRecord {
                batch_id: batch_id.to_string(),
                latest_sequence: 0,
                current_stage: node_name.to_string(),
                status: RunStatus::Running,
                created_at: now,
                updated_at: now,
            },
        });
        let sequence = record.snapshots.last().map_or(1, |s| s.sequence + 1);
        record.snapshots.push(StoredSnapshot {
            sequence,
            node_name: node_name.to_string(),
            attempt,
            payload,
            created_at: now,
        });
        record.index.latest_sequence = sequence;
        record.index.current_stage = node_name.to_string();
        record.index.updated_at = now;
        Ok(sequence)
    }

    async fn load_latest(&self, batch_id: &str) -> Result<Option<StateSnapshot>> {
        let runs = self.runs.read().await;
        let Some(stored) = runs.get(batch_id).and_then(|r| r.snapshots.last()) else {
            return Ok(None);
        };
        let state = self.serializer.loads(&stored.payload)?;
        Ok(Some(StateSnapshot {
            batch_id: batch_id.to_string(),
            sequence: stored.sequence,
            node_name: stored.node_name.clone(),
            attempt: stored.attempt,
            state,
            created_at: stored.created_at,
        }))
    }

    async fn list_active(&self, status: Option<RunStatus>) -> Result<Vec<RunIndexRecord>> {
        let runs = self.runs.read().await;
        let mut records: Vec<RunIndexRecord> = runs
            .values()
            .map(|r| r.index.clone())
            .filter(|index| match status {
                Some(wanted) => index.status == wanted,
                None => index.status.is_active(),
            })
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn update_status(&self, batch_id: &str, status: RunStatus, stage: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let record = runs
            .get_mut(batch_id)
            .ok_or_else(|| CheckpointError::UnknownRun(batch_id.to_string()))?;
        record.index.status = status;
        record.index.current_stage = stage.to_string();
        record.index.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_run(&self, batch_id: &str) -> Result<()> {
        self.runs.write().await.remove(batch_id);
        Ok(())
    }
}
