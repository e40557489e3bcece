//! Dynamic task creation for fan-out execution.
//!
//! A [`Send`] asks the runtime to schedule one concurrent invocation of a
//! target node with its own task state. A node returning a batch of `Send`s
//! (via [`NodeOutput::Fanout`](crate::graph::NodeOutput)) is how the grading
//! engine dispatches one worker per student batch: each task carries a deep
//! copy of exactly the state that worker needs, so siblings never share
//! mutable data.
//!
//! The `task_id` is carried explicitly rather than derived from the task
//! state. The runtime sorts sibling results by it before merging, which is
//! what makes fan-in deterministic regardless of completion order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A dynamically created task targeting one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Send {
    /// Registered node that will execute this task.
    pub target: String,

    /// Stable identifier used to order sibling updates at fan-in.
    pub task_id: String,

    /// Input state for this task. The target node receives this value, not
    /// the run's main state.
    pub task_state: Value,
}

impl Send {
    /// Create a task for `target` with the given ordering id and state.
    pub fn new(
        target: impl Into<String>,
        task_id: impl Into<String>,
        task_state: Value,
    ) -> Self {
        Self {
            target: target.into(),
            task_id: task_id.into(),
            task_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_round_trips_through_json() {
        let send = Send::new("grade_batch", "b0001", json!({"pages": [0, 1]}));
        let encoded = serde_json::to_string(&send).unwrap();
        let decoded: Send = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.target, "grade_batch");
        assert_eq!(decoded.task_id, "b0001");
        assert_eq!(decoded.task_state["pages"][0], 0);
    }
}
