//! Per-run event streaming.
//!
//! Every run gets one broadcast channel. The publisher never blocks: a
//! subscriber that falls more than `buffer_size` events behind loses the
//! overwritten events (with a warning) and keeps receiving from there.
//! Within one run, events are totally ordered; across runs nothing is
//! promised.

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::broadcast;
use tracing::warn;

/// Event types emitted over a run's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    Progress,
    PartialResult,
    ReviewRequired,
    RunCompleted,
    RunFailed,
}

/// One event on a run's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: EventType,
    pub batch_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Boxed event stream handed to subscribers.
pub type EventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

/// Registry of per-run broadcast channels.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<RunEvent>>>,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    fn sender(&self, batch_id: &str) -> broadcast::Sender<RunEvent> {
        if let Some(sender) = self.channels.read().get(batch_id) {
            return sender.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(batch_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }

    /// Publish one event. Never blocks; an event with no subscribers is
    /// simply dropped.
    pub fn publish(&self, batch_id: &str, event_type: EventType, payload: Value) {
        let event = RunEvent {
            event_type,
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        let _ = self.sender(batch_id).send(event);
    }

    /// Attach a subscriber. It receives every event published from this
    /// point forward; lagging drops the oldest events with a warning.
    pub fn subscribe(&self, batch_id: &str) -> EventStream {
        let mut receiver = self.sender(batch_id).subscribe();
        let batch_id = batch_id.to_string();
        Box::pin(async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(batch_id = %batch_id, missed, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Drop a run's channel. Called when the run reaches a terminal state;
    /// attached subscribers drain whatever is already buffered and then see
    /// their stream end.
    pub fn remove(&self, batch_id: &str) {
        self.channels.write().remove(batch_id);
    }
}
