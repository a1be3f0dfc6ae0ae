//! Fleet-level lifecycle: bounded-concurrency start, readiness gating,
//! concurrent graceful stop, and per-node process control.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::runner::NodeRunner;
use crate::api::{probe_ready, NodeApi};
use crate::identity::Address;
use crate::{plog, plog_debug, plog_error, plog_warn, Error, Result};

/// Signal asking a client to dump its internal state to its log.
const DIAGNOSTIC_SIGNAL: i32 = libc::SIGUSR1;

#[derive(Debug, Clone, Copy)]
pub struct FleetTimeouts {
    pub readiness: Duration,
    pub stop: Duration,
    pub poll: Duration,
}

impl Default for FleetTimeouts {
    fn default() -> Self {
        Self {
            readiness: Duration::from_secs(120),
            stop: Duration::from_secs(30),
            poll: Duration::from_millis(500),
        }
    }
}

/// Addresses and API endpoints of every node, fixed for the whole run.
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    pub addresses: Vec<Address>,
    pub endpoints: Vec<String>,
}

impl NodeDirectory {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn address(&self, index: usize) -> Result<Address> {
        self.addresses.get(index).copied().ok_or(Error::NodeIndex {
            index,
            count: self.len(),
        })
    }

    pub fn endpoint(&self, index: usize) -> Result<&str> {
        self.endpoints
            .get(index)
            .map(String::as_str)
            .ok_or(Error::NodeIndex {
                index,
                count: self.len(),
            })
    }
}

/// Pending readiness check started by [`NodeController::start`].
///
/// Dropping the barrier does not stop the check; call [`wait`](Self::wait)
/// to learn the outcome.
pub struct ReadinessBarrier {
    handle: JoinHandle<Result<()>>,
}

impl ReadinessBarrier {
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop polling; used when setup fails before the barrier is awaited.
    pub fn abort(self) {
        self.handle.abort();
    }
}

pub struct NodeController {
    runners: Vec<NodeRunner>,
    api: Arc<dyn NodeApi>,
    timeouts: FleetTimeouts,
}

impl NodeController {
    pub fn new(runners: Vec<NodeRunner>, api: Arc<dyn NodeApi>, timeouts: FleetTimeouts) -> Self {
        Self {
            runners,
            api,
            timeouts,
        }
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn runners(&self) -> &[NodeRunner] {
        &self.runners
    }

    pub fn runner(&self, index: usize) -> Result<&NodeRunner> {
        let count = self.runners.len();
        self.runners
            .get(index)
            .ok_or(Error::NodeIndex { index, count })
    }

    pub fn runner_mut(&mut self, index: usize) -> Result<&mut NodeRunner> {
        let count = self.runners.len();
        self.runners
            .get_mut(index)
            .ok_or(Error::NodeIndex { index, count })
    }

    pub fn directory(&self) -> NodeDirectory {
        NodeDirectory {
            addresses: self.runners.iter().map(NodeRunner::address).collect(),
            endpoints: self.runners.iter().map(NodeRunner::base_url).collect(),
        }
    }

    /// Create data directories, keystores and password files for all nodes.
    pub fn prepare(&self) -> Result<()> {
        for runner in &self.runners {
            runner.prepare()?;
        }
        Ok(())
    }

    /// Spawn every node, at most `available_parallelism` spawns in flight,
    /// and return a barrier that resolves once every node reports ready.
    pub async fn start(&mut self) -> Result<ReadinessBarrier> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        plog!(
            "Starting {} nodes ({} concurrent spawns)",
            self.runners.len(),
            parallelism
        );
        let results: Vec<Result<()>> = stream::iter(self.runners.iter_mut())
            .map(|runner| runner.start())
            .buffer_unordered(parallelism)
            .collect()
            .await;
        results.into_iter().collect::<Result<Vec<()>>>()?;

        let indices: Vec<usize> = (0..self.runners.len()).collect();
        Ok(self.readiness_barrier(&indices))
    }

    /// [`start`](Self::start) and wait for readiness.
    pub async fn start_and_wait(&mut self) -> Result<()> {
        self.start().await?.wait().await
    }

    fn readiness_barrier(&self, indices: &[usize]) -> ReadinessBarrier {
        let targets: Vec<(usize, String)> = indices
            .iter()
            .filter_map(|i| self.runners.get(*i).map(|r| (*i, r.base_url())))
            .collect();
        let api = Arc::clone(&self.api);
        let timeouts = self.timeouts;
        ReadinessBarrier {
            handle: tokio::spawn(wait_until_ready(api, targets, timeouts)),
        }
    }

    /// Interrupt every node concurrently and wait for all of them. Every
    /// node gets its stop attempt; the first failure is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let timeout = self.timeouts.stop;
        plog!("Stopping {} nodes", self.runners.len());
        let results = join_all(self.runners.iter_mut().map(|runner| runner.stop(timeout))).await;
        let mut first = None;
        for (index, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                plog_error!("Node {} failed to stop: {}", index, e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Spawn one node and return its readiness barrier. The barrier does
    /// not borrow the controller, so a caller sharing the fleet can release
    /// it before waiting.
    pub async fn spawn_node(&mut self, index: usize) -> Result<ReadinessBarrier> {
        self.runner_mut(index)?.start().await?;
        Ok(self.readiness_barrier(&[index]))
    }

    pub async fn start_node(&mut self, index: usize) -> Result<()> {
        self.spawn_node(index).await?.wait().await
    }

    pub async fn stop_node(&mut self, index: usize) -> Result<()> {
        let timeout = self.timeouts.stop;
        self.runner_mut(index)?.stop(timeout).await
    }

    pub async fn kill_node(&mut self, index: usize) -> Result<()> {
        self.runner_mut(index)?.kill().await
    }

    pub fn update_node_options(&mut self, index: usize, options: Map<String, Value>) -> Result<()> {
        self.runner_mut(index)?.update_options(options)
    }

    pub fn is_running(&mut self, index: usize) -> Result<bool> {
        Ok(self.runner_mut(index)?.is_running())
    }

    pub fn any_running(&mut self) -> bool {
        self.runners.iter_mut().any(NodeRunner::is_running)
    }

    pub fn running_indices(&mut self) -> Vec<usize> {
        self.runners
            .iter_mut()
            .filter_map(|r| if r.is_running() { Some(r.index()) } else { None })
            .collect()
    }

    /// Ask every live client to dump diagnostics; failures are only logged.
    pub fn capture_diagnostics(&mut self) {
        for runner in &mut self.runners {
            if let Err(e) = runner.signal(DIAGNOSTIC_SIGNAL) {
                plog_warn!(
                    "Could not signal node {} for diagnostics: {}",
                    runner.index(),
                    e
                );
            }
        }
    }
}

async fn wait_until_ready(
    api: Arc<dyn NodeApi>,
    targets: Vec<(usize, String)>,
    timeouts: FleetTimeouts,
) -> Result<()> {
    let deadline = Instant::now() + timeouts.readiness;
    try_join_all(
        targets
            .into_iter()
            .map(|(index, url)| wait_node_ready(Arc::clone(&api), index, url, deadline, timeouts)),
    )
    .await?;
    Ok(())
}

async fn wait_node_ready(
    api: Arc<dyn NodeApi>,
    index: usize,
    base_url: String,
    deadline: Instant,
    timeouts: FleetTimeouts,
) -> Result<()> {
    loop {
        let ready = tokio::time::timeout_at(deadline, probe_ready(api.as_ref(), &base_url))
            .await
            .unwrap_or(false);
        if ready {
            plog_debug!("Node {} is ready", index);
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::NodeNotReady {
                index,
                timeout: timeouts.readiness,
            });
        }
        tokio::time::sleep(timeouts.poll).await;
    }
}
