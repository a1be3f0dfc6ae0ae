//! Task engine: the task arena, the type registry, the executor and every
//! built-in task type.

pub mod assert;
pub mod channel;
pub mod context;
pub mod engine;
pub mod process;
pub mod registry;
pub mod task;
pub mod wait;

pub use context::{Partner, RunContext, RETRY_INTERVAL};
pub use engine::TaskEngine;
pub use registry::{LeafFactory, TaskAction, TaskKind, TaskOutcome, TaskRegistry};
pub use task::{TaskBody, TaskId, TaskNode, TaskState, TaskTree, TaskView};

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Keys handled by the engine for every task, never forwarded as payload.
pub(crate) const COMMON_KEYS: &[&str] = &["name", "timeout", "abort_on_fail", "sync_delay"];

pub(crate) fn config_map<'a>(task: &str, config: &'a Value) -> Result<&'a Map<String, Value>> {
    config
        .as_object()
        .ok_or_else(|| Error::Config(format!("{}: expected a map, got {}", task, config)))
}

pub(crate) fn required<'a>(task: &str, config: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    config
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::Config(format!("{}: missing required key '{}'", task, key)))
}

pub(crate) fn node_index(task: &str, value: &Value) -> Result<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|i| i as usize),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::Config(format!("{}: invalid node index {}", task, value)))
}

/// Node index given either bare or as `{node: N}`.
pub(crate) fn node_target(task: &str, config: &Value) -> Result<usize> {
    match config {
        Value::Object(map) => node_index(task, required(task, map, "node")?),
        other => node_index(task, other),
    }
}
