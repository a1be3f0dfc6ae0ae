//! Whole runs: setup, task tree and teardown against fake clients.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use scenario_player::api::Method;
use scenario_player::definition::ScenarioDefinition;
use scenario_player::identity::Address;
use scenario_player::orchestrator::{RunnerSettings, ScenarioLayout};
use scenario_player::tasks::{TaskId, TaskState};
use scenario_player::{Error, ScenarioRunner};

use crate::fixtures::{fake_client, MemoryLedger, ScriptedApi};

const NODES: usize = 2;
const TOKEN: Address = Address([0x70; 20]);

fn settings(dir: &TempDir) -> RunnerSettings {
    RunnerSettings {
        data_path: dir.path().join("data"),
        client_binary: fake_client(dir.path()),
        eth_rpc_endpoint: "http://127.0.0.1:8545".to_string(),
        network_id: 4321,
        password: "test".to_string(),
        readiness_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(5),
    }
}

fn definition(root: Value) -> ScenarioDefinition {
    ScenarioDefinition::from_json(
        &json!({
            "name": "player",
            "nodes": {"count": NODES},
            "settings": {
                "confirmations": 0,
                "poll_interval": 0.1,
                "confirmation_timeout": 10,
                "discovery_timeout": 10,
            },
            "scenario": root,
        })
        .to_string(),
    )
    .expect("Failed to parse scenario")
}

/// Node API on which the token network already exists and every node lists it.
fn api() -> Arc<ScriptedApi> {
    let api = Arc::new(ScriptedApi::new());
    api.respond(Method::GET, "/api/v1/tokens/", 200, json!(TOKEN.to_checksum()));
    api.respond(Method::GET, "/api/v1/tokens", 200, json!([TOKEN.to_checksum()]));
    api
}

fn ledger() -> Arc<MemoryLedger> {
    Arc::new(MemoryLedger::new().with_balance(Address([0xee; 20]), 100_000_000_000_000_000_000))
}

fn assert_fleet_stopped(layout: &ScenarioLayout) {
    for index in 0..NODES {
        let dir = layout.node_dir(0, index);
        assert!(dir.join("marker.txt").is_file(), "node {} never started", index);
        assert!(dir.join("stopped.txt").is_file(), "node {} was not stopped", index);
    }
}

/// Test: Teardown after a failing task
/// Given a started fleet and a task tree whose only request is rejected
/// When the run executes
/// Then the task error is returned and every node is interrupted on the way out
#[tokio::test]
async fn test_failing_tree_stops_fleet() {
    let dir = TempDir::new().unwrap();
    let api = api();
    api.respond(Method::POST, "/api/v1/rejected", 409, json!({"errors": "conflict"}));
    let runner = ScenarioRunner::new(
        definition(json!({"serial": {"tasks": [
            {"request": {"from": 0, "method": "POST", "path": "/api/v1/rejected"}},
        ]}})),
        settings(&dir),
        api.clone(),
        ledger(),
    )
    .unwrap();

    let err = runner.run().await.unwrap_err();

    assert!(
        matches!(err, Error::Request { status: 409, .. }),
        "unexpected error: {}",
        err
    );
    assert_fleet_stopped(&runner.layout());
    let tasks = runner.tasks();
    assert_eq!(tasks.state(TaskId(1)), Some(TaskState::Errored));
    assert_eq!(tasks.state(TaskId(2)), Some(TaskState::Errored));
    assert_eq!(tasks.running_count(), 0);
    assert_eq!(api.count(&Method::POST, "/api/v1/rejected"), 1);
}

/// Test: Operator interrupt
/// Given a run blocked in a long wait
/// When the run is cancelled
/// Then it reports the cancellation, no task is left running, and the fleet
/// is stopped
#[tokio::test]
async fn test_cancelled_run_settles_tasks() {
    let dir = TempDir::new().unwrap();
    let runner = ScenarioRunner::new(
        definition(json!({"serial": {"tasks": [{"wait": 60}]}})),
        settings(&dir),
        api(),
        ledger(),
    )
    .unwrap();

    let cancel = runner.cancel_token();
    let tasks = runner.tasks();
    tokio::spawn(async move {
        while tasks.running_count() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
    });

    let err = runner.run().await.unwrap_err();

    assert!(matches!(err, Error::Cancelled), "unexpected error: {}", err);
    let tasks = runner.tasks();
    assert_eq!(tasks.running_count(), 0);
    assert_eq!(tasks.state(TaskId(1)), Some(TaskState::Errored));
    assert_eq!(tasks.state(TaskId(2)), Some(TaskState::Errored));
    assert_fleet_stopped(&runner.layout());
}
