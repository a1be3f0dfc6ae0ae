//! Tasks controlling individual node processes mid-scenario.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::context::RunContext;
use super::registry::{TaskAction, TaskOutcome};
use super::{config_map, node_index, node_target, required};
use crate::{plog, Error, Result};

#[derive(Debug)]
pub struct StartNode {
    node: usize,
}

impl StartNode {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        Ok(Box::new(Self {
            node: node_target("start_node", config)?,
        }))
    }
}

#[async_trait]
impl TaskAction for StartNode {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        let barrier = ctx.nodes.lock().await.spawn_node(self.node).await;
        match barrier {
            Ok(barrier) => match barrier.wait().await {
                Ok(()) => TaskOutcome::Done(Value::Null),
                Err(e) => TaskOutcome::Fatal(e),
            },
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}

#[derive(Debug)]
pub struct StopNode {
    node: usize,
}

impl StopNode {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        Ok(Box::new(Self {
            node: node_target("stop_node", config)?,
        }))
    }
}

#[async_trait]
impl TaskAction for StopNode {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        let mut nodes = ctx.nodes.lock().await;
        match nodes.stop_node(self.node).await {
            Ok(()) => TaskOutcome::Done(Value::Null),
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}

#[derive(Debug)]
pub struct KillNode {
    node: usize,
}

impl KillNode {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        Ok(Box::new(Self {
            node: node_target("kill_node", config)?,
        }))
    }
}

#[async_trait]
impl TaskAction for KillNode {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        let mut nodes = ctx.nodes.lock().await;
        match nodes.kill_node(self.node).await {
            Ok(()) => TaskOutcome::Done(Value::Null),
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}

/// `{node, options}`: new options apply from the node's next start.
#[derive(Debug)]
pub struct UpdateNodeOptions {
    node: usize,
    options: Map<String, Value>,
}

impl UpdateNodeOptions {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("update_node_options", config)?;
        let options = required("update_node_options", map, "options")?
            .as_object()
            .cloned()
            .ok_or_else(|| Error::Config("update_node_options: 'options' must be a map".into()))?;
        Ok(Box::new(Self {
            node: node_index("update_node_options", required("update_node_options", map, "node")?)?,
            options,
        }))
    }
}

#[async_trait]
impl TaskAction for UpdateNodeOptions {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        let result = match ctx.render_value(&Value::Object(self.options.clone())) {
            Ok(Value::Object(options)) => {
                let mut nodes = ctx.nodes.lock().await;
                nodes.update_node_options(self.node, options)
            }
            Ok(other) => Err(Error::Config(format!("options rendered to {}", other))),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                plog!("Node {} options updated", self.node);
                TaskOutcome::Done(Value::Null)
            }
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}
