use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use scenario_player::api::HttpNodeApi;
use scenario_player::config::PlayerConfig;
use scenario_player::definition::ScenarioDefinition;
use scenario_player::identity::Address;
use scenario_player::ledger::JsonRpcLedger;
use scenario_player::node::{SnapshotManager, SnapshotPolicy};
use scenario_player::orchestrator::{RunnerSettings, ScenarioLayout};
use scenario_player::tasks::{TaskRegistry, TaskState, TaskTree, TaskView};
use scenario_player::{plog, plog_debug, plog_warn, Error, Result, ScenarioRunner};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Scenario player - end-to-end test runner for payment-channel node fleets
#[derive(Parser, Debug)]
#[command(name = "scenario-player")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SP_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that override `~/.scenario-player/player.toml`.
#[derive(clap::Args, Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    /// Directory holding every scenario's working directory
    #[arg(long)]
    pub data_path: Option<String>,

    /// Node client executable (name on PATH or a path)
    #[arg(long)]
    pub client_binary: Option<String>,

    /// Ledger JSON-RPC endpoint
    #[arg(long)]
    pub eth_rpc_endpoint: Option<String>,

    /// Unlocked account paying for funding and deployments
    #[arg(long)]
    pub operator_address: Option<String>,

    #[arg(long)]
    pub network_id: Option<u64>,

    /// File with the hex bytecode of the test token contract
    #[arg(long)]
    pub token_bytecode: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a scenario against a fresh or restored node fleet
    Run {
        /// Scenario definition (JSON)
        scenario: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Build the task tree of a scenario without running anything
    Check {
        scenario: PathBuf,
    },

    /// List the registered task types
    Tasks,

    /// Write the given settings to ~/.scenario-player/player.toml
    Init {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Delete the fleet snapshot of a scenario
    SnapshotDelete {
        scenario: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    scenario_player::log::init_with_debug(cli.debug);
    if scenario_player::log::is_debug() {
        plog_debug!("scenario-player {} (debug mode enabled)", env!("CARGO_PKG_VERSION"));
    }

    match cli.command {
        Command::Run {
            scenario,
            overrides,
        } => run_scenario(&scenario, overrides),
        Command::Check { scenario } => run_check(&scenario),
        Command::Tasks => run_tasks(),
        Command::Init { overrides } => run_init(overrides),
        Command::SnapshotDelete {
            scenario,
            overrides,
        } => run_snapshot_delete(&scenario, overrides),
    }
}

fn load_config(overrides: &Overrides) -> Result<PlayerConfig> {
    let mut config = PlayerConfig::load()?;
    if let Some(path) = &overrides.data_path {
        config.data_path = Some(path.clone());
    }
    if let Some(binary) = &overrides.client_binary {
        config.client_binary = Some(binary.clone());
    }
    if let Some(endpoint) = &overrides.eth_rpc_endpoint {
        config.eth_rpc_endpoint = Some(endpoint.clone());
    }
    if let Some(operator) = &overrides.operator_address {
        config.operator_address = Some(operator.clone());
    }
    if let Some(id) = overrides.network_id {
        config.network_id = Some(id);
    }
    if let Some(path) = &overrides.token_bytecode {
        config.token_bytecode = Some(std::fs::read_to_string(path)?.trim().to_string());
    }
    Ok(config)
}

fn build_ledger(config: &PlayerConfig, scenario: &ScenarioDefinition) -> Result<JsonRpcLedger> {
    let operator: Address = config
        .operator_address
        .as_deref()
        .ok_or_else(|| {
            Error::Config(
                "operator address is required (--operator-address or operator_address in player.toml)"
                    .to_string(),
            )
        })?
        .parse()?;
    let ledger = JsonRpcLedger::new(
        config.effective_rpc_endpoint(),
        operator,
        scenario.settings.gas_price,
    )?;
    match &config.token_bytecode {
        Some(bytecode) => ledger.with_token_bytecode(bytecode),
        None => Ok(ledger),
    }
}

/// Run one scenario. Ctrl-C cancels the run; the fleet is still stopped.
fn run_scenario(path: &PathBuf, overrides: Overrides) -> Result<()> {
    let scenario = ScenarioDefinition::load(path)?;
    let config = load_config(&overrides)?;
    let settings = RunnerSettings::from_config(&config)?;
    plog_debug!(
        "Run command: scenario={}, data_path={}, client={}",
        scenario.name,
        settings.data_path.display(),
        settings.client_binary.display()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let ledger = build_ledger(&config, &scenario)?;
        let runner = ScenarioRunner::new(
            scenario,
            settings,
            Arc::new(HttpNodeApi::new()?),
            Arc::new(ledger),
        )?;

        let cancel = runner.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                plog_warn!("Interrupt received, stopping the run");
                cancel.cancel();
            }
        });

        let tasks = runner.tasks();
        let progress = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                plog!("{} tasks running", tasks.running_count());
            }
        });

        let result = runner.run().await;
        progress.abort();

        print_tasks(&runner.tasks().views());
        match result {
            Ok(summary) => {
                println!();
                println!(
                    "Scenario '{}' run {} passed in {:.1}s{}",
                    summary.scenario,
                    summary.run_number,
                    summary.duration.as_secs_f64(),
                    if summary.restored_from_snapshot {
                        " (restored from snapshot)"
                    } else {
                        ""
                    }
                );
                Ok(())
            }
            Err(e) => {
                println!();
                println!("Scenario failed: {}", e);
                Err(e)
            }
        }
    })
}

fn print_tasks(views: &[TaskView]) {
    for view in views {
        let depth = ancestors(views, view);
        let label = match &view.name {
            Some(name) => format!("{} ({})", view.type_name, name),
            None => view.type_name.clone(),
        };
        let state = if view.skipped {
            "skipped".to_string()
        } else {
            view.state.to_string()
        };
        let elapsed = view
            .elapsed
            .map(|d| format!(" {:.1}s", d.as_secs_f64()))
            .unwrap_or_default();
        println!(
            "{:>4} {}{:<40} {:<12}{}",
            view.id.to_string(),
            "  ".repeat(depth),
            label,
            state,
            elapsed
        );
        if view.state == TaskState::Errored {
            if let Some(error) = &view.error {
                println!("     {}  {}", "  ".repeat(depth), error);
            }
        }
    }
}

fn ancestors(views: &[TaskView], view: &TaskView) -> usize {
    let mut depth = 0;
    let mut parent = view.parent;
    while let Some(id) = parent {
        depth += 1;
        parent = views.iter().find(|v| v.id == id).and_then(|v| v.parent);
    }
    depth
}

fn run_check(path: &PathBuf) -> Result<()> {
    let scenario = ScenarioDefinition::load(path)?;
    scenario.validate()?;
    let tree = TaskTree::build(&TaskRegistry::builtin()?, &scenario)?;
    print_tasks(&tree.views());
    println!();
    println!(
        "Scenario '{}': {} nodes, {} tasks",
        scenario.name,
        scenario.nodes.count,
        tree.len()
    );
    Ok(())
}

fn run_tasks() -> Result<()> {
    for name in TaskRegistry::builtin()?.names() {
        println!("{}", name);
    }
    Ok(())
}

fn run_init(overrides: Overrides) -> Result<()> {
    let config = load_config(&overrides)?;
    if let Some(operator) = &config.operator_address {
        operator.parse::<Address>()?;
    }
    config.save()?;
    println!("Wrote {}", PlayerConfig::config_path()?.display());
    Ok(())
}

/// Delete the snapshot of the fleet the last run used.
fn run_snapshot_delete(path: &PathBuf, overrides: Overrides) -> Result<()> {
    let scenario = ScenarioDefinition::load(path)?;
    let config = load_config(&overrides)?;
    let data_path = config.data_dir()?;
    let layout = ScenarioLayout::new(&data_path, &scenario.name);
    let Some(run_number) = layout.current_run_number()? else {
        println!("Scenario '{}' has never run; nothing to delete", scenario.name);
        return Ok(());
    };
    let seed = layout.seed()?;

    let settings = RunnerSettings {
        data_path,
        client_binary: PathBuf::from(config.effective_client_binary()),
        eth_rpc_endpoint: config.effective_rpc_endpoint().to_string(),
        network_id: config.effective_network_id(),
        password: config.effective_password().to_string(),
        readiness_timeout: config.readiness_timeout(),
        stop_timeout: config.stop_timeout(),
    };
    let policy = SnapshotPolicy {
        reuse_accounts: scenario.nodes.reuse_accounts,
        token_pinned: scenario.token.is_pinned(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let ledger = build_ledger(&config, &scenario)?;
        let runner = ScenarioRunner::new(
            scenario,
            settings,
            Arc::new(HttpNodeApi::new()?),
            Arc::new(ledger),
        )?;
        let mut fleet = runner.build_fleet(&layout, run_number, &seed)?;
        SnapshotManager::new(layout.snapshot_root(), policy)
            .delete(&mut fleet)
            .await
    })?;
    println!("Snapshot deleted");
    Ok(())
}
