//! Node controller integration tests.
//!
//! These spawn real processes (a shell stand-in for the client) and verify
//! the readiness barrier, per-node control and fleet shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use scenario_player::api::{Method, STATUS_PATH};
use scenario_player::node::FleetTimeouts;
use scenario_player::tasks::{TaskEngine, TaskId, TaskState};
use scenario_player::Error;

use crate::fixtures::{context, fleet, scenario, tree, MemoryLedger, ScriptedApi};

fn timeouts() -> FleetTimeouts {
    FleetTimeouts {
        readiness: Duration::from_secs(2),
        stop: Duration::from_secs(5),
        poll: Duration::from_millis(100),
    }
}

/// Test: Readiness barrier names the laggard
/// Given a 3-node fleet whose node 1 never reports ready
/// When the fleet starts and the barrier is awaited
/// Then the barrier fails for node 1 and the fleet still stops cleanly
#[tokio::test]
async fn test_unready_node_fails_barrier() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::new());
    let mut fleet = fleet(&dir, 3, api.clone(), timeouts());
    let laggard = format!("{}{}", fleet.runners()[1].base_url(), STATUS_PATH);
    api.respond(Method::GET, &laggard, 503, json!({"status": "unavailable"}));

    let err = fleet.start_and_wait().await.unwrap_err();
    assert!(
        matches!(err, Error::NodeNotReady { index: 1, .. }),
        "unexpected error: {}",
        err
    );

    assert_eq!(fleet.running_indices(), vec![0, 1, 2]);
    fleet.stop().await.unwrap();
    assert!(!fleet.any_running());
}

/// Test: Fleet lifecycle
/// Given a 2-node fleet that reports ready
/// When it starts, one node is killed and the rest is stopped
/// Then process state follows every step
#[tokio::test]
async fn test_start_kill_stop() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::new());
    let mut fleet = fleet(&dir, 2, api, timeouts());

    fleet.start_and_wait().await.unwrap();
    assert!(fleet.is_running(0).unwrap());
    assert!(fleet.is_running(1).unwrap());
    let data_dir = fleet.runners()[0].data_dir().to_path_buf();
    assert!(data_dir.join("keys").is_dir());
    assert!(data_dir.join("password.txt").is_file());

    fleet.kill_node(1).await.unwrap();
    assert!(!fleet.is_running(1).unwrap());
    assert_eq!(fleet.running_indices(), vec![0]);

    fleet.stop().await.unwrap();
    assert!(!fleet.any_running());

    // Restart a single node after the fleet went down.
    fleet.start_node(1).await.unwrap();
    assert_eq!(fleet.running_indices(), vec![1]);
    fleet.stop_node(1).await.unwrap();
    assert!(!fleet.any_running());
}

/// Test: Option updates
/// Given a fleet that was never started
/// When options are updated
/// Then regular options apply to the next command line and the API
/// address is refused
#[test]
fn test_update_node_options() {
    let dir = TempDir::new().unwrap();
    let mut fleet = fleet(&dir, 1, Arc::new(ScriptedApi::new()), timeouts());

    let update = json!({"routing-mode": "private"});
    fleet
        .update_node_options(0, update.as_object().cloned().unwrap())
        .unwrap();
    let args = fleet.runners()[0].command_line();
    assert!(args.windows(2).any(|w| w[0] == "--routing-mode" && w[1] == "private"));

    let update = json!({"api-address": "127.0.0.1:1"});
    let err = fleet
        .update_node_options(0, update.as_object().cloned().unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidNodeOption { index: 0, .. }));

    assert!(matches!(
        fleet.is_running(5),
        Err(Error::NodeIndex { index: 5, count: 1 })
    ));
}

/// Test: Deadlines hold while a node is starting
/// Given a parallel group where node 0 never becomes ready and an assert
/// with a 1 second timeout never matches
/// When the group runs
/// Then the assert fails on its own deadline, long before the start gives
/// up, and the starting node is asked for diagnostics
#[tokio::test]
async fn test_assert_deadline_not_blocked_by_start_node() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::new());
    api.respond(Method::GET, "/api/v1/channels/", 200, json!({"balance": "101"}));
    let timeouts = FleetTimeouts {
        readiness: Duration::from_secs(4),
        stop: Duration::from_secs(5),
        poll: Duration::from_millis(100),
    };
    let nodes = fleet(&dir, 2, api.clone(), timeouts);
    let laggard = format!("{}{}", nodes.runners()[0].base_url(), STATUS_PATH);
    api.respond(Method::GET, &laggard, 503, json!({"status": "unavailable"}));
    nodes.prepare().unwrap();

    let scenario = scenario(
        2,
        json!({"parallel": {"tasks": [
            {"start_node": 0},
            {"assert": {"from": 0, "to": 1, "balance": 100, "timeout": 1}},
        ]}}),
    );
    let tree = tree(&scenario);
    let mut ctx = context(scenario, api, Arc::new(MemoryLedger::new()));
    ctx.nodes = Arc::new(tokio::sync::Mutex::new(nodes));

    let err = TaskEngine::new(&tree, &ctx).run().await.unwrap_err();

    assert!(matches!(err, Error::NodeNotReady { index: 0, .. }), "unexpected error: {}", err);
    assert_eq!(tree.state(TaskId(3)), Some(TaskState::Errored));
    assert!(tree.error(TaskId(3)).unwrap().contains("101"));
    assert!(tree.elapsed(TaskId(3)).unwrap() < Duration::from_secs(3));
    assert!(tree.elapsed(TaskId(2)).unwrap() >= Duration::from_secs(4));

    let mut nodes = ctx.nodes.lock().await;
    let node0 = nodes.runners()[0].data_dir().to_path_buf();
    nodes.stop().await.unwrap();
    assert!(node0.join("diagnostics.txt").is_file());
}
