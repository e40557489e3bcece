//! # gradeflow-checkpoint - Run Snapshot Persistence
//!
//! Persistence layer for grading runs. After every completed node the
//! runtime hands the merged state here; on resume, the latest snapshot tells
//! the runtime which node last finished and what the state looked like.
//!
//! The crate provides:
//!
//! - [`Checkpointer`] - the storage trait. Backends must serialize writes
//!   per `batch_id`; beyond that they are free to store snapshots wherever
//!   they like (the grading engine only requires the in-memory backend, a
//!   database-backed one plugs in through the same trait).
//! - [`InMemoryCheckpointer`] - reference backend used in development and
//!   tests. Ephemeral, thread-safe, with `clear()` for test isolation.
//! - [`SnapshotSerializer`] - pluggable snapshot codec through which every
//!   backend encodes state payloads; [`JsonSerializer`] is the default.
//!
//! A checkpoint write failure is expected to be survivable: callers treat it
//! as a downgrade to best-effort execution, not as a reason to abort grading.

pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;
pub mod types;

pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointer;
pub use serializer::{JsonSerializer, SnapshotSerializer};
pub use traits::Checkpointer;
pub use types::{RunIndexRecord, RunStatus, StateSnapshot};
