//! Key-wise state merging.
//!
//! Graph state is a single JSON object. Nodes return partial updates; the
//! runtime folds each update into the state with fixed reducer semantics:
//!
//! | Value shape | Reducer |
//! |---|---|
//! | Array + Array | append |
//! | Object + Object | deep merge, recursing with the same rules |
//! | anything else | overwrite with the update |
//!
//! A `null` update value overwrites (a node can clear a field by writing
//! `null`), but a missing key leaves the current value untouched. These are
//! the semantics every node in the grading graph relies on: `errors` and
//! `cross_page_questions` accumulate, `grading_results` entries from parallel
//! workers merge into one map, and scalars like `progress` track the most
//! recent writer.

use serde_json::{Map, Value};

/// Merge a partial update into `state` in place.
///
/// `state` must be a JSON object; updates that are not objects are ignored
/// (there is nothing key-wise to merge). Returns whether anything changed.
pub fn merge_update(state: &mut Value, update: &Value) -> bool {
    let Some(update_map) = update.as_object() else {
        return false;
    };
    if update_map.is_empty() {
        return false;
    }
    if !state.is_object() {
        *state = Value::Object(Map::new());
    }
    let state_map = state.as_object_mut().expect("state is an object");
    for (key, incoming) in update_map {
        match state_map.get_mut(key) {
            Some(current) => merge_value(current, incoming),
            None => {
                state_map.insert(key.clone(), incoming.clone());
            }
        }
    }
    true
}

fn merge_value(current: &mut Value, incoming: &Value) {
    match (&mut *current, incoming) {
        (Value::Array(curr), Value::Array(inc)) => {
            curr.extend(inc.iter().cloned());
        }
        (Value::Object(curr), Value::Object(inc)) => {
            for (key, value) in inc {
                match curr.get_mut(key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        curr.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, _) => {
            *slot = incoming.clone();
        }
    }
}
