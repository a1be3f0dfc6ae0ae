//! Executes a [`TaskTree`] against a [`RunContext`].
//!
//! Composites run their children inside the parent's own future: serial
//! children one after another, parallel children through a bounded
//! `buffer_unordered` stream. Nothing is detached, so cancelling the root
//! future (or the run's token) stops the whole tree. Task futures borrow
//! the tree and context, so they are not `Send` and run on the caller's task.

use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::time::{sleep, sleep_until, Instant};

use super::context::RunContext;
use super::registry::{TaskAction, TaskOutcome};
use super::task::{TaskBody, TaskId, TaskNode, TaskTree};
use crate::util::sleep_or_cancel;
use crate::{plog, plog_debug, plog_error, plog_warn, Error, Result};

pub struct TaskEngine<'a> {
    tree: &'a TaskTree,
    ctx: &'a RunContext,
}

impl<'a> TaskEngine<'a> {
    pub fn new(tree: &'a TaskTree, ctx: &'a RunContext) -> Self {
        Self { tree, ctx }
    }

    /// Run the root task to completion.
    pub async fn run(&self) -> Result<()> {
        self.run_task(self.tree.root()).await
    }

    /// Run one task and everything below it. Marks the task's terminal
    /// state and returns its error, unless `abort_on_fail` is off.
    pub fn run_task(&self, id: TaskId) -> LocalBoxFuture<'_, Result<()>> {
        async move {
            let node = self
                .tree
                .node(id)
                .ok_or_else(|| Error::Config(format!("no task with id {}", id)))?;
            if self.ctx.cancel.is_cancelled() {
                self.tree.mark_errored(id, &Error::Cancelled);
                return Err(Error::Cancelled);
            }

            self.tree.mark_running(id);
            plog_debug!("Task {} started", node.label());

            let result = match (&node.body, node.timeout) {
                (TaskBody::Leaf(action), timeout) => self.run_leaf(node, action.as_ref(), timeout).await,
                (_, Some(timeout)) => {
                    match tokio::time::timeout(timeout, self.run_composite(node)).await {
                        Ok(result) => result,
                        Err(_) => {
                            self.ctx.capture_diagnostics();
                            let err = Error::TaskTimeout {
                                id: id.0,
                                name: node.label(),
                                timeout,
                            };
                            self.tree.settle_interrupted(id, &err);
                            Err(err)
                        }
                    }
                }
                (_, None) => self.run_composite(node).await,
            };

            let result = match result {
                Ok(()) => sleep_or_cancel(node.sync_delay, &self.ctx.cancel).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.tree.mark_finished(id);
                    plog_debug!(
                        "Task {} finished in {:?}",
                        node.label(),
                        self.tree.elapsed(id).unwrap_or_default()
                    );
                    Ok(())
                }
                Err(e) => {
                    self.tree.mark_errored(id, &e);
                    if !node.abort_on_fail && !matches!(e, Error::Cancelled) {
                        plog_warn!("Task {} failed, continuing: {}", node.label(), e);
                        return Ok(());
                    }
                    plog_error!("Task {} failed: {}", node.label(), e);
                    Err(e)
                }
            }
        }
        .boxed_local()
    }

    async fn run_composite(&self, node: &TaskNode) -> Result<()> {
        match &node.body {
            TaskBody::Serial => self.run_serial(&node.children).await,
            TaskBody::Parallel { max_concurrent } => {
                self.run_parallel(&node.children, *max_concurrent).await
            }
            TaskBody::Snapshot => self.run_snapshot(node).await,
            TaskBody::Leaf(_) => Err(Error::Config(format!(
                "task {} is not a composite",
                node.label()
            ))),
        }
    }

    /// Strict order; the first failure skips the remaining children.
    async fn run_serial(&self, children: &[TaskId]) -> Result<()> {
        for child in children {
            self.run_task(*child).await?;
        }
        Ok(())
    }

    /// Every child runs to a terminal state before the first failure, in
    /// child order, is reported.
    async fn run_parallel(&self, children: &[TaskId], max_concurrent: Option<usize>) -> Result<()> {
        let limit = max_concurrent.unwrap_or(children.len()).max(1);
        let mut results: Vec<(usize, Result<()>)> =
            stream::iter(children.iter().copied().enumerate())
                .map(move |(position, child)| {
                    self.run_task(child).map(move |result| (position, result))
                })
                .buffer_unordered(limit)
                .collect()
                .await;
        results.sort_by_key(|(position, _)| *position);
        results
            .into_iter()
            .map(|(_, result)| result)
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// On a fresh fleet: run the children, then stop the fleet, snapshot
    /// it and bring it back up. On a restored fleet the subtree is skipped.
    async fn run_snapshot(&self, node: &TaskNode) -> Result<()> {
        if self.ctx.restored_from_snapshot {
            plog!("Task {}: fleet restored from snapshot, skipping", node.label());
            for child in &node.children {
                self.tree.mark_skipped(*child);
            }
            return Ok(());
        }
        self.run_serial(&node.children).await?;

        let mut nodes = self.ctx.nodes.lock().await;
        nodes.stop().await?;
        self.ctx.snapshots.take(&mut nodes).await?;
        nodes.start_and_wait().await
    }

    /// Run a leaf action, retrying while its timeout allows.
    async fn run_leaf(
        &self,
        node: &TaskNode,
        action: &dyn TaskAction,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let Some(timeout) = timeout else {
            self.tree.record_attempt(node.id);
            let outcome = tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Err(Error::Cancelled),
                outcome = action.run(self.ctx) => outcome,
            };
            return match outcome {
                TaskOutcome::Done(_) => Ok(()),
                TaskOutcome::Retry(msg) => Err(Error::Assertion(msg)),
                TaskOutcome::Fatal(e) => Err(e),
            };
        };

        let deadline = Instant::now() + timeout;
        let mut last_retry: Option<String> = None;
        loop {
            let attempt = self.tree.record_attempt(node.id);
            let outcome = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep_until(deadline) => break,
                outcome = action.run(self.ctx) => outcome,
            };
            match outcome {
                TaskOutcome::Done(_) => return Ok(()),
                TaskOutcome::Fatal(e) => return Err(e),
                TaskOutcome::Retry(msg) => {
                    plog_debug!("Task {} attempt {}: {}", node.label(), attempt, msg);
                    last_retry = Some(msg);
                }
            }
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep_until(deadline) => break,
                _ = sleep(self.ctx.retry_interval) => {}
            }
        }

        plog_warn!(
            "Task {} timed out after {:?}, capturing node diagnostics",
            node.label(),
            timeout
        );
        self.ctx.capture_diagnostics();
        Err(match last_retry {
            Some(msg) => Error::Assertion(msg),
            None => Error::TaskTimeout {
                id: node.id.0,
                name: node.label(),
                timeout,
            },
        })
    }
}
