//! One scenario run from run-number allocation to fleet teardown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::confirm::{register_token_network, wait_for_confirmations, wait_for_discovery, Polling};
use super::funding::{
    check_operator_balance, fund_eth, fund_tokens, plan_udc, resolve_token, submit_udc_deposits,
};
use super::layout::ScenarioLayout;
use crate::api::NodeApi;
use crate::config::PlayerConfig;
use crate::definition::ScenarioDefinition;
use crate::identity::{derive_identity, Address};
use crate::ledger::{Ledger, TxHash};
use crate::node::{
    FleetTimeouts, LaunchSettings, NodeController, NodeDirectory, NodeRunner, SnapshotManager,
    SnapshotPolicy,
};
use crate::store::RunStore;
use crate::tasks::{RunContext, TaskEngine, TaskRegistry, TaskState, TaskTree, TaskView, RETRY_INTERVAL};
use crate::{log, plog, plog_error, plog_warn, Error, Result};

/// Machine-level settings a run needs besides the scenario itself.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub data_path: PathBuf,
    pub client_binary: PathBuf,
    pub eth_rpc_endpoint: String,
    pub network_id: u64,
    pub password: String,
    pub readiness_timeout: Duration,
    pub stop_timeout: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &PlayerConfig) -> Result<Self> {
        Ok(Self {
            data_path: config.data_dir()?,
            client_binary: resolve_client_binary(config.effective_client_binary())?,
            eth_rpc_endpoint: config.effective_rpc_endpoint().to_string(),
            network_id: config.effective_network_id(),
            password: config.effective_password().to_string(),
            readiness_timeout: config.readiness_timeout(),
            stop_timeout: config.stop_timeout(),
        })
    }
}

/// A bare name is looked up on `PATH`; anything with a separator is used as is.
pub fn resolve_client_binary(binary: &str) -> Result<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(binary));
    }
    which::which(binary)
        .map_err(|e| Error::Config(format!("client binary '{}' not found: {}", binary, e)))
}

/// Outcome of a run, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub run_number: u32,
    pub duration: Duration,
    pub restored_from_snapshot: bool,
    pub tasks: Vec<TaskView>,
}

impl RunSummary {
    pub fn errored(&self) -> impl Iterator<Item = &TaskView> {
        self.tasks.iter().filter(|t| t.state == TaskState::Errored)
    }
}

pub struct ScenarioRunner {
    scenario: Arc<ScenarioDefinition>,
    settings: RunnerSettings,
    api: Arc<dyn NodeApi>,
    ledger: Arc<dyn Ledger>,
    tree: Arc<TaskTree>,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    /// Build the run. The task tree is constructed here, so an invalid
    /// scenario fails before anything touches the disk or the ledger.
    pub fn new(
        scenario: ScenarioDefinition,
        settings: RunnerSettings,
        api: Arc<dyn NodeApi>,
        ledger: Arc<dyn Ledger>,
    ) -> Result<Self> {
        Self::with_registry(scenario, settings, api, ledger, &TaskRegistry::builtin()?)
    }

    pub fn with_registry(
        scenario: ScenarioDefinition,
        settings: RunnerSettings,
        api: Arc<dyn NodeApi>,
        ledger: Arc<dyn Ledger>,
        registry: &TaskRegistry,
    ) -> Result<Self> {
        scenario.validate()?;
        let tree = Arc::new(TaskTree::build(registry, &scenario)?);
        Ok(Self {
            scenario: Arc::new(scenario),
            settings,
            api,
            ledger,
            tree,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that aborts the run when cancelled (operator interrupt).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live view of the task tree, safe to poll while the run executes.
    pub fn tasks(&self) -> Arc<TaskTree> {
        Arc::clone(&self.tree)
    }

    pub fn layout(&self) -> ScenarioLayout {
        ScenarioLayout::new(&self.settings.data_path, &self.scenario.name)
    }

    fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            reuse_accounts: self.scenario.nodes.reuse_accounts,
            token_pinned: self.scenario.token.is_pinned(),
        }
    }

    fn udc_address(&self) -> Option<Address> {
        let udc = &self.scenario.settings.services.udc;
        if udc.enable {
            udc.address
        } else {
            None
        }
    }

    /// Runners for this run's fleet. With `reuse_accounts` the identities and
    /// data directories do not depend on the run number.
    pub fn build_fleet(
        &self,
        layout: &ScenarioLayout,
        run_number: u32,
        seed: &str,
    ) -> Result<NodeController> {
        let nodes = &self.scenario.nodes;
        let (identity_run, dir_tag) = if nodes.reuse_accounts {
            (None, 0)
        } else {
            (Some(run_number), run_number)
        };
        let launch = Arc::new(LaunchSettings {
            binary: self.settings.client_binary.clone(),
            eth_rpc_endpoint: self.settings.eth_rpc_endpoint.clone(),
            network_id: self
                .scenario
                .settings
                .network_id
                .unwrap_or(self.settings.network_id),
            password: self.settings.password.clone(),
            run_number,
            pfs_url: self.scenario.settings.services.pfs.url.clone(),
            udc_address: self.udc_address(),
            default_options: nodes.default_options.clone(),
        });
        let runners = (0..nodes.count)
            .map(|index| {
                NodeRunner::new(
                    index,
                    derive_identity(seed, &self.scenario.name, identity_run, index)?,
                    layout.node_dir(dir_tag, index),
                    nodes.node_options.get(&index).cloned().unwrap_or_default(),
                    Arc::clone(&launch),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(NodeController::new(
            runners,
            Arc::clone(&self.api),
            FleetTimeouts {
                readiness: self.settings.readiness_timeout,
                stop: self.settings.stop_timeout,
                ..FleetTimeouts::default()
            },
        ))
    }

    fn polling(&self, timeout: Duration) -> Result<Polling> {
        Ok(Polling {
            interval: self.scenario.settings.poll_interval()?,
            timeout,
        })
    }

    /// Steps (5)-(7): user deposits, token, node funding, confirmations.
    async fn prepare_ledger(
        &self,
        layout: &ScenarioLayout,
        run_number: u32,
        directory: &NodeDirectory,
    ) -> Result<Address> {
        let ledger = self.ledger.as_ref();
        let settings = &self.scenario.settings;
        let confirmation = self.polling(settings.confirmation_timeout()?)?;
        let mut pending: Vec<TxHash> = Vec::new();

        if let Some(udc) = self.udc_address() {
            let plan = plan_udc(ledger, udc, &settings.services.udc.token, &directory.addresses)
                .await?;
            wait_for_confirmations(ledger, &plan.preparation, 0, confirmation, &self.cancel)
                .await?;
            pending.extend(submit_udc_deposits(ledger, udc, &plan).await?);
        }

        let token = resolve_token(ledger, layout, &self.scenario, run_number).await?;
        pending.extend(token.deployed.clone());
        pending.extend(
            fund_eth(
                ledger,
                &directory.addresses,
                settings.eth_min_balance,
                settings.eth_fund_balance,
            )
            .await?,
        );
        pending.extend(
            fund_tokens(
                ledger,
                token.address,
                &directory.addresses,
                self.scenario.token.balance_min,
                self.scenario.token.balance_fund,
            )
            .await?,
        );

        wait_for_confirmations(
            ledger,
            &pending,
            settings.confirmations,
            confirmation,
            &self.cancel,
        )
        .await?;
        Ok(token.address)
    }

    /// Everything after the fleet exists: start, fund, discover, run tasks.
    async fn drive(
        &self,
        layout: &ScenarioLayout,
        run_number: u32,
        nodes: &Arc<Mutex<NodeController>>,
        snapshots: SnapshotManager,
        restored: bool,
    ) -> Result<()> {
        let directory = nodes.lock().await.directory();

        let barrier = nodes.lock().await.start().await?;
        let token = match self.prepare_ledger(layout, run_number, &directory).await {
            Ok(token) => token,
            Err(e) => {
                barrier.abort();
                return Err(e);
            }
        };
        barrier.wait().await?;
        plog!("All {} nodes ready", directory.len());

        register_token_network(self.api.as_ref(), &directory, token).await?;
        wait_for_discovery(
            Arc::clone(&self.api),
            &directory,
            token,
            self.polling(self.scenario.settings.discovery_timeout()?)?,
            &self.cancel,
        )
        .await?;

        let ctx = RunContext {
            scenario: Arc::clone(&self.scenario),
            run_number,
            nodes: Arc::clone(nodes),
            directory,
            snapshots,
            api: Arc::clone(&self.api),
            ledger: Arc::clone(&self.ledger),
            store: RunStore::new(),
            token,
            udc: self.udc_address(),
            restored_from_snapshot: restored,
            cancel: self.cancel.clone(),
            retry_interval: RETRY_INTERVAL,
            poll_interval: self.scenario.settings.poll_interval()?,
        };
        let engine = TaskEngine::new(&self.tree, &ctx);
        plog!("Running scenario '{}' ({} tasks)", self.scenario.name, self.tree.len());
        match self.scenario.settings.run_timeout()? {
            Some(limit) => match tokio::time::timeout(limit, engine.run()).await {
                Ok(result) => result,
                Err(_) => {
                    ctx.capture_diagnostics();
                    Err(Error::Timeout(limit))
                }
            },
            None => engine.run().await,
        }
    }

    /// Execute the whole run. The fleet is stopped exactly once on the way
    /// out, whatever happened; the first error wins.
    pub async fn run(&self) -> Result<RunSummary> {
        let layout = self.layout();
        layout.ensure()?;
        log::set_log_file(&layout.log_file());

        let run_number = layout.next_run_number()?;
        log::set_run(run_number);
        let seed = layout.seed()?;
        plog!("Scenario '{}' run {}", self.scenario.name, run_number);

        check_operator_balance(
            self.ledger.as_ref(),
            self.scenario.settings.operator_min_balance,
        )
        .await?;

        let mut fleet = self.build_fleet(&layout, run_number, &seed)?;
        fleet.prepare()?;
        let snapshots = SnapshotManager::new(layout.snapshot_root(), self.snapshot_policy());
        let restored = if self.scenario.nodes.restore_snapshot {
            snapshots.restore(&mut fleet).await?
        } else {
            false
        };
        let nodes = Arc::new(Mutex::new(fleet));

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.drive(&layout, run_number, &nodes, snapshots, restored) => result,
        };
        if let Err(e) = &outcome {
            plog_error!("Run {} failed: {}", run_number, e);
            self.tree.settle_interrupted(self.tree.root(), e);
        }

        let teardown = nodes.lock().await.stop().await;
        let summary = RunSummary {
            scenario: self.scenario.name.clone(),
            run_number,
            duration: started.elapsed(),
            restored_from_snapshot: restored,
            tasks: self.tree.views(),
        };
        match (outcome, teardown) {
            (Err(e), Err(stop)) => {
                plog_warn!("Fleet shutdown also failed: {}", stop);
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                plog!(
                    "Run {} finished in {:?}",
                    run_number,
                    summary.duration
                );
                Ok(summary)
            }
        }
    }
}
