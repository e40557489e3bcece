//! Serialization protocol for snapshot payloads.

use crate::error::Result;
use serde_json::Value;

/// Codec for snapshot state payloads.
///
/// Backends store snapshot state as opaque bytes produced here, so a
/// database-backed implementation can swap the codec without touching its
/// storage logic. Snapshot state is a self-describing JSON document; codecs
/// must round-trip arbitrary `Value`s.
pub trait SnapshotSerializer: Send + Sync {
    /// Serialize a state document to bytes.
    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserialize a state document from bytes.
    fn loads(&self, data: &[u8]) -> Result<Value>;
}

/// JSON codec (default).
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SnapshotSerializer for JsonSerializer {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}
