//! Task data model: an arena of task nodes built once per run.
//!
//! Every task lives in a flat `Vec` owned by [`TaskTree`] and refers to its
//! parent and children by [`TaskId`]. Ids start at 1 and increase in
//! construction (pre-order) order. Mutable execution status sits behind a
//! per-task mutex so concurrently running children can share the tree.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::registry::{TaskAction, TaskKind, TaskRegistry};
use crate::definition::ScenarioDefinition;
use crate::util::seconds;
use crate::{Error, Result};

/// Unique identifier for a task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle. Transitions only move forward:
/// `Initialized -> Running -> {Finished, Errored}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Initialized,
    Running,
    Finished,
    Errored,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Errored)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Initialized => write!(f, "initialized"),
            TaskState::Running => write!(f, "running"),
            TaskState::Finished => write!(f, "finished"),
            TaskState::Errored => write!(f, "errored"),
        }
    }
}

/// Body of a task: how the engine executes it.
#[derive(Debug)]
pub enum TaskBody {
    Serial,
    Parallel { max_concurrent: Option<usize> },
    Snapshot,
    Leaf(Box<dyn TaskAction>),
}

#[derive(Debug)]
pub struct TaskNode {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub type_name: String,
    /// Optional display name from the `name` config key.
    pub name: Option<String>,
    pub config: Value,
    pub timeout: Option<Duration>,
    /// Sleep after the task succeeds.
    pub sync_delay: Duration,
    pub abort_on_fail: bool,
    pub body: TaskBody,
}

impl TaskNode {
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("#{} {} ({})", self.id, self.type_name, name),
            None => format!("#{} {}", self.id, self.type_name),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TaskStatus {
    state: TaskState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished: Option<Instant>,
    error: Option<String>,
    attempts: u32,
    skipped: bool,
}

/// Read-only snapshot of one task for progress reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub type_name: String,
    pub name: Option<String>,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed: Option<Duration>,
    pub attempts: u32,
    pub error: Option<String>,
    pub skipped: bool,
}

#[derive(Debug)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
    statuses: Vec<Mutex<TaskStatus>>,
}

impl TaskTree {
    /// Build the whole tree for `scenario` before anything runs. Unknown
    /// task types and malformed task configs fail here.
    pub fn build(registry: &TaskRegistry, scenario: &ScenarioDefinition) -> Result<Self> {
        let (type_name, config) = scenario.root_task()?;
        let mut tree = Self {
            nodes: Vec::new(),
            statuses: Vec::new(),
        };
        tree.add(registry, scenario, type_name, config, None)?;
        Ok(tree)
    }

    fn add(
        &mut self,
        registry: &TaskRegistry,
        scenario: &ScenarioDefinition,
        type_name: &str,
        config: &Value,
        parent: Option<TaskId>,
    ) -> Result<TaskId> {
        let task_type = registry.get(type_name)?;
        let id = TaskId(self.nodes.len() as u64 + 1);

        let common = CommonKeys::parse(type_name, config)?;
        let sync_delay = match common.sync_delay {
            Some(delay) => delay,
            None => scenario
                .sync_delay_for(type_name)?
                .unwrap_or(task_type.sync_delay),
        };

        let (body, child_specs) = match &task_type.kind {
            TaskKind::Serial => (TaskBody::Serial, serial_children(type_name, config)?),
            TaskKind::Snapshot => (TaskBody::Snapshot, serial_children(type_name, config)?),
            TaskKind::Parallel => {
                let max_concurrent = optional_count(type_name, config, "max_concurrent")?;
                (
                    TaskBody::Parallel { max_concurrent },
                    child_list(type_name, config)?,
                )
            }
            TaskKind::Leaf(factory) => (TaskBody::Leaf(factory(config)?), Vec::new()),
        };

        self.nodes.push(TaskNode {
            id,
            parent,
            children: Vec::new(),
            type_name: type_name.to_string(),
            name: common.name,
            config: config.clone(),
            timeout: common.timeout,
            sync_delay,
            abort_on_fail: common.abort_on_fail,
            body,
        });
        self.statuses.push(Mutex::new(TaskStatus::default()));

        let mut children = Vec::with_capacity(child_specs.len());
        for (child_type, child_config) in child_specs {
            children.push(self.add(registry, scenario, &child_type, &child_config, Some(id))?);
        }
        self.node_mut(id).children = children;
        Ok(id)
    }

    fn index(&self, id: TaskId) -> Option<usize> {
        let index = (id.0 as usize).checked_sub(1)?;
        (index < self.nodes.len()).then_some(index)
    }

    fn node_mut(&mut self, id: TaskId) -> &mut TaskNode {
        let index = (id.0 - 1) as usize;
        &mut self.nodes[index]
    }

    fn status(&self, id: TaskId) -> Option<MutexGuard<'_, TaskStatus>> {
        let index = self.index(id)?;
        Some(
            self.statuses[index]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn root(&self) -> TaskId {
        TaskId(1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.index(id).map(|i| &self.nodes[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    pub fn parent(&self, id: TaskId) -> Option<&TaskNode> {
        self.node(id)?.parent.and_then(|p| self.node(p))
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.status(id).map(|s| s.state)
    }

    pub fn is_done(&self, id: TaskId) -> bool {
        self.state(id).is_some_and(TaskState::is_terminal)
    }

    pub fn attempts(&self, id: TaskId) -> u32 {
        self.status(id).map(|s| s.attempts).unwrap_or(0)
    }

    pub fn error(&self, id: TaskId) -> Option<String> {
        self.status(id).and_then(|s| s.error.clone())
    }

    pub fn is_skipped(&self, id: TaskId) -> bool {
        self.status(id).is_some_and(|s| s.skipped)
    }

    pub(crate) fn mark_running(&self, id: TaskId) {
        if let Some(mut status) = self.status(id) {
            if status.state == TaskState::Initialized {
                status.state = TaskState::Running;
                status.started_at = Some(Utc::now());
                status.started = Some(Instant::now());
            }
        }
    }

    fn finish(&self, id: TaskId, state: TaskState, error: Option<String>) {
        if let Some(mut status) = self.status(id) {
            if status.state.is_terminal() {
                return;
            }
            let now = Instant::now();
            status.state = state;
            status.started.get_or_insert(now);
            status.started_at.get_or_insert_with(Utc::now);
            status.finished = Some(now);
            status.finished_at = Some(Utc::now());
            status.error = error;
        }
    }

    pub(crate) fn mark_finished(&self, id: TaskId) {
        self.finish(id, TaskState::Finished, None);
    }

    pub(crate) fn mark_errored(&self, id: TaskId, error: &Error) {
        self.finish(id, TaskState::Errored, Some(error.to_string()));
    }

    /// Mark `id` and its whole subtree finished without running it.
    pub(crate) fn mark_skipped(&self, id: TaskId) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(mut status) = self.status(current) {
                status.skipped = true;
            }
            self.finish(current, TaskState::Finished, None);
            if let Some(node) = self.node(current) {
                pending.extend(node.children.iter().copied());
            }
        }
    }

    /// Error every task under `id` (inclusive) that is still running. Used
    /// when a deadline or cancellation drops in-flight futures.
    pub(crate) fn settle_interrupted(&self, id: TaskId, error: &Error) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if self.state(current) == Some(TaskState::Running) {
                self.mark_errored(current, error);
            }
            if let Some(node) = self.node(current) {
                pending.extend(node.children.iter().copied());
            }
        }
    }

    pub(crate) fn record_attempt(&self, id: TaskId) -> u32 {
        match self.status(id) {
            Some(mut status) => {
                status.attempts += 1;
                status.attempts
            }
            None => 0,
        }
    }

    /// Time spent running so far, or the total once the task is done.
    pub fn elapsed(&self, id: TaskId) -> Option<Duration> {
        let status = self.status(id)?;
        let started = status.started?;
        let end = status.finished.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(started))
    }

    pub fn running_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| {
                s.lock()
                    .map(|s| s.state == TaskState::Running)
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn view(&self, id: TaskId) -> Option<TaskView> {
        let node = self.node(id)?;
        let elapsed = self.elapsed(id);
        let status = self.status(id)?;
        Some(TaskView {
            id,
            parent: node.parent,
            type_name: node.type_name.clone(),
            name: node.name.clone(),
            state: status.state,
            started_at: status.started_at,
            finished_at: status.finished_at,
            elapsed,
            attempts: status.attempts,
            error: status.error.clone(),
            skipped: status.skipped,
        })
    }

    pub fn views(&self) -> Vec<TaskView> {
        self.nodes.iter().filter_map(|n| self.view(n.id)).collect()
    }
}

/// Keys every task config object may carry.
struct CommonKeys {
    name: Option<String>,
    timeout: Option<Duration>,
    sync_delay: Option<Duration>,
    abort_on_fail: bool,
}

impl CommonKeys {
    fn parse(type_name: &str, config: &Value) -> Result<Self> {
        let Some(map) = config.as_object() else {
            return Ok(Self {
                name: None,
                timeout: None,
                sync_delay: None,
                abort_on_fail: true,
            });
        };
        let name = map.get("name").and_then(Value::as_str).map(str::to_string);
        let timeout = match optional_seconds(type_name, map.get("timeout"), "timeout")? {
            Some(t) if !t.is_zero() => Some(t),
            _ => None,
        };
        let sync_delay = optional_seconds(type_name, map.get("sync_delay"), "sync_delay")?;
        let abort_on_fail = match map.get("abort_on_fail") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(Error::Config(format!(
                    "{}: abort_on_fail must be a boolean, got {}",
                    type_name, other
                )))
            }
        };
        Ok(Self {
            name,
            timeout,
            sync_delay,
            abort_on_fail,
        })
    }
}

fn optional_seconds(type_name: &str, value: Option<&Value>, key: &str) -> Result<Option<Duration>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let secs = v.as_f64().ok_or_else(|| {
                Error::Config(format!("{}: {} must be a number of seconds", type_name, key))
            })?;
            seconds(secs).map(Some)
        }
    }
}

fn optional_count(type_name: &str, config: &Value, key: &str) -> Result<Option<usize>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .filter(|n| *n > 0)
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                Error::Config(format!("{}: {} must be a positive integer", type_name, key))
            }),
    }
}

/// Child specs of a composite: `tasks` is a list of single-key maps.
fn child_list(type_name: &str, config: &Value) -> Result<Vec<(String, Value)>> {
    let tasks = config
        .get("tasks")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Config(format!("{}: missing 'tasks' list", type_name)))?;
    tasks
        .iter()
        .map(|entry| {
            let map = entry.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
                Error::Config(format!(
                    "{}: every child must be a map with exactly one task type, got {}",
                    type_name, entry
                ))
            })?;
            let (child_type, child_config) = map
                .iter()
                .next()
                .ok_or_else(|| Error::Config(format!("{}: empty child task", type_name)))?;
            Ok((child_type.clone(), child_config.clone()))
        })
        .collect()
}

/// Serial children, with `repeat` unrolled so every run of a child is its
/// own task.
fn serial_children(type_name: &str, config: &Value) -> Result<Vec<(String, Value)>> {
    let once = child_list(type_name, config)?;
    let repeat = optional_count(type_name, config, "repeat")?.unwrap_or(1);
    let mut children = Vec::with_capacity(once.len() * repeat);
    for _ in 0..repeat {
        children.extend(once.iter().cloned());
    }
    Ok(children)
}
