//! Tasks that only wait: wall-clock time, ledger blocks, or the operator.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::context::RunContext;
use super::registry::{TaskAction, TaskOutcome};
use super::required;
use crate::util::{seconds, sleep_or_cancel};
use crate::{plog, plog_debug, Error, Result};

/// Read a number given bare or under `key` in a map.
fn scalar(task: &str, config: &Value, key: &str) -> Result<f64> {
    let value = match config {
        Value::Object(map) => required(task, map, key)?,
        other => other,
    };
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .filter(|v| *v >= 0.0)
    .ok_or_else(|| Error::Config(format!("{}: '{}' must be a non-negative number", task, key)))
}

/// `wait: <seconds>` or `{seconds}`.
#[derive(Debug)]
pub struct Wait {
    duration: Duration,
}

impl Wait {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        Ok(Box::new(Self {
            duration: seconds(scalar("wait", config, "seconds")?)?,
        }))
    }
}

#[async_trait]
impl TaskAction for Wait {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        plog_debug!("Waiting {:?}", self.duration);
        match sleep_or_cancel(self.duration, &ctx.cancel).await {
            Ok(()) => TaskOutcome::Done(Value::Null),
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}

/// `wait_blocks: <count>` or `{blocks}`: wait until the ledger has mined
/// that many blocks past the current height.
#[derive(Debug)]
pub struct WaitBlocks {
    blocks: u64,
}

impl WaitBlocks {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        Ok(Box::new(Self {
            blocks: scalar("wait_blocks", config, "blocks")? as u64,
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let start = ctx.ledger.block_number().await?;
        let target = start + self.blocks;
        plog!("Waiting for block {} (now {})", target, start);
        loop {
            let current = ctx.ledger.block_number().await?;
            if current >= target {
                return Ok(json!({"block": current}));
            }
            sleep_or_cancel(ctx.poll_interval, &ctx.cancel).await?;
        }
    }
}

#[async_trait]
impl TaskAction for WaitBlocks {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        match self.execute(ctx).await {
            Ok(value) => TaskOutcome::Done(value),
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}

/// Block until the operator presses enter.
#[derive(Debug)]
pub struct WaitInteractive {
    prompt: String,
}

impl WaitInteractive {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let prompt = match config {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or("Press enter to continue")
                .to_string(),
            _ => "Press enter to continue".to_string(),
        };
        Ok(Box::new(Self { prompt }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        eprintln!("{}", self.prompt);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
            line = lines.next_line() => Ok(json!(line?.unwrap_or_default())),
        }
    }
}

#[async_trait]
impl TaskAction for WaitInteractive {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        match self.execute(ctx).await {
            Ok(value) => TaskOutcome::Done(value),
            Err(e) => TaskOutcome::Fatal(e),
        }
    }
}
