//! Task-type registry and the leaf action interface.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::context::RunContext;
use super::{assert, channel, process, wait};
use crate::{Error, Result};

/// Result of one attempt of a leaf action.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Success, with the response or value the action produced.
    Done(Value),
    /// Not there yet; try again while the task's timeout allows.
    Retry(String),
    Fatal(Error),
}

impl TaskOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskOutcome::Done(_))
    }
}

impl From<Result<Value>> for TaskOutcome {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => TaskOutcome::Done(value),
            Err(e) if e.is_retryable() => TaskOutcome::Retry(e.to_string()),
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}

/// One leaf task's work. Called once per attempt.
#[async_trait]
pub trait TaskAction: Send + Sync + fmt::Debug {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome;
}

/// Builds a leaf action from its task config. Malformed configs are
/// rejected here, before the run starts.
pub type LeafFactory = fn(&Value) -> Result<Box<dyn TaskAction>>;

#[derive(Clone, Copy)]
pub enum TaskKind {
    Serial,
    Parallel,
    Snapshot,
    Leaf(LeafFactory),
}

#[derive(Clone)]
pub struct TaskType {
    pub name: String,
    pub kind: TaskKind,
    /// Post-success delay unless the scenario overrides it.
    pub sync_delay: Duration,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    types: HashMap<String, TaskType>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in task type.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register("serial", TaskKind::Serial)?;
        registry.register("parallel", TaskKind::Parallel)?;
        registry.register("snapshot", TaskKind::Snapshot)?;

        registry.register("open_channel", TaskKind::Leaf(channel::OpenChannel::build))?;
        registry.register("close_channel", TaskKind::Leaf(channel::CloseChannel::build))?;
        registry.register("deposit", TaskKind::Leaf(channel::Deposit::build))?;
        registry.register("withdraw", TaskKind::Leaf(channel::Withdraw::build))?;
        registry.register("transfer", TaskKind::Leaf(channel::Transfer::build))?;
        registry.register(
            "store_channel_info",
            TaskKind::Leaf(channel::StoreChannelInfo::build),
        )?;
        registry.register("request", TaskKind::Leaf(channel::RawRequest::build))?;

        registry.register("assert", TaskKind::Leaf(assert::AssertChannel::build))?;
        registry.register("assert_all", TaskKind::Leaf(assert::AssertAll::build))?;
        registry.register("assert_sum", TaskKind::Leaf(assert::AssertSum::build))?;

        registry.register("start_node", TaskKind::Leaf(process::StartNode::build))?;
        registry.register("stop_node", TaskKind::Leaf(process::StopNode::build))?;
        registry.register("kill_node", TaskKind::Leaf(process::KillNode::build))?;
        registry.register(
            "update_node_options",
            TaskKind::Leaf(process::UpdateNodeOptions::build),
        )?;

        registry.register("wait", TaskKind::Leaf(wait::Wait::build))?;
        registry.register("wait_blocks", TaskKind::Leaf(wait::WaitBlocks::build))?;
        registry.register(
            "wait_interactive",
            TaskKind::Leaf(wait::WaitInteractive::build),
        )?;
        Ok(registry)
    }

    /// Add a task type with no default sync delay.
    pub fn register(&mut self, name: &str, kind: TaskKind) -> Result<()> {
        self.register_with_delay(name, kind, Duration::ZERO)
    }

    /// Add a task type. Registering a name twice is an error.
    pub fn register_with_delay(
        &mut self,
        name: &str,
        kind: TaskKind,
        sync_delay: Duration,
    ) -> Result<()> {
        if self.types.contains_key(name) {
            return Err(Error::DuplicateTaskType(name.to_string()));
        }
        self.types.insert(
            name.to_string(),
            TaskType {
                name: name.to_string(),
                kind,
                sync_delay,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&TaskType> {
        self.types
            .get(name)
            .ok_or_else(|| Error::UnknownTaskType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("types", &self.names())
            .finish()
    }
}
