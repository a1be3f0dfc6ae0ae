//! Task tree execution against a scripted node API.
//!
//! Time is paused in these tests, so waits, retries and deadlines advance
//! instantly while `Instant` differences still reflect scenario time.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use scenario_player::api::Method;
use scenario_player::identity::Address;
use scenario_player::tasks::{TaskEngine, TaskId, TaskState};
use scenario_player::Error;

use crate::fixtures::{context, is_assertion, scenario, tree, MemoryLedger, ScriptedApi};

/// Test: Serial open + wait
/// Given a serial list of open_channel and a 5 second wait
/// When the tree runs
/// Then exactly one channel open is issued and the run takes at least 5s
#[tokio::test(start_paused = true)]
async fn test_open_channel_then_wait() {
    let api = Arc::new(ScriptedApi::new());
    api.respond(Method::PUT, "/api/v1/channels", 201, json!({"state": "opened"}));
    let scenario = scenario(
        2,
        json!({"serial": {"tasks": [
            {"open_channel": {"from": 0, "to": 1, "total_deposit": 1000}},
            {"wait": 5},
        ]}}),
    );
    let tree = tree(&scenario);
    let ctx = context(scenario, api.clone(), Arc::new(MemoryLedger::new()));

    let started = Instant::now();
    TaskEngine::new(&tree, &ctx).run().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));

    assert_eq!(api.count(&Method::PUT, "/api/v1/channels"), 1);
    let open = api
        .requests()
        .into_iter()
        .find(|r| r.method == Method::PUT)
        .unwrap();
    assert!(open.url.starts_with("http://node0/"));
    let body = open.body.unwrap();
    assert_eq!(body["partner_address"], json!(Address([2; 20]).to_checksum()));
    assert_eq!(body["total_deposit"], json!(1000));
    assert!(tree.views().iter().all(|v| v.state == TaskState::Finished));
}

/// Test: Assertion converges
/// Given a channel whose balance reads 101, then 100
/// When an assert with a 2 second budget expects 100
/// Then it finishes after exactly two attempts
#[tokio::test(start_paused = true)]
async fn test_assert_retries_until_match() {
    let api = Arc::new(ScriptedApi::new());
    api.respond_seq(
        Method::GET,
        "/api/v1/channels/",
        vec![(200, json!({"balance": "101"})), (200, json!({"balance": "100"}))],
    );
    let scenario = scenario(
        2,
        json!({"assert": {"from": 0, "to": 1, "balance": 100, "timeout": 2}}),
    );
    let tree = tree(&scenario);
    let ctx = context(scenario, api.clone(), Arc::new(MemoryLedger::new()));

    TaskEngine::new(&tree, &ctx).run().await.unwrap();

    assert_eq!(tree.state(tree.root()), Some(TaskState::Finished));
    assert_eq!(tree.attempts(tree.root()), 2);
    assert_eq!(api.count(&Method::GET, "/api/v1/channels/"), 2);
}

/// Test: Timeout bound
/// Given a channel that never reaches the expected balance
/// When an assert with a 2 second budget runs
/// Then it fails with the last mismatch no later than the next retry
#[tokio::test(start_paused = true)]
async fn test_assert_gives_up_at_deadline() {
    let api = Arc::new(ScriptedApi::new());
    api.respond(Method::GET, "/api/v1/channels/", 200, json!({"balance": "101"}));
    let scenario = scenario(
        2,
        json!({"assert": {"from": 0, "to": 1, "balance": 100, "timeout": 2}}),
    );
    let tree = tree(&scenario);
    let ctx = context(scenario, api, Arc::new(MemoryLedger::new()));

    let started = Instant::now();
    let err = TaskEngine::new(&tree, &ctx).run().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(is_assertion(&err), "unexpected error: {}", err);
    assert!(err.to_string().contains("101"));
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(tree.state(tree.root()), Some(TaskState::Errored));
}

/// Test: Serial abort
/// Given a serial list whose first request is rejected with 409
/// When the tree runs
/// Then later siblings are never started
#[tokio::test(start_paused = true)]
async fn test_serial_aborts_on_failure() {
    let api = Arc::new(ScriptedApi::new());
    api.respond(Method::POST, "/api/v1/rejected", 409, json!({"errors": "conflict"}));
    let scenario = scenario(
        2,
        json!({"serial": {"tasks": [
            {"request": {"from": 0, "method": "post", "path": "/api/v1/rejected"}},
            {"open_channel": {"from": 0, "to": 1}},
        ]}}),
    );
    let tree = tree(&scenario);
    let ctx = context(scenario, api.clone(), Arc::new(MemoryLedger::new()));

    let err = TaskEngine::new(&tree, &ctx).run().await.unwrap_err();

    assert!(matches!(err, Error::Request { status: 409, .. }));
    assert_eq!(tree.state(TaskId(1)), Some(TaskState::Errored));
    assert_eq!(tree.state(TaskId(2)), Some(TaskState::Errored));
    assert_eq!(tree.state(TaskId(3)), Some(TaskState::Initialized));
    assert_eq!(api.count(&Method::PUT, "/api/v1/channels"), 0);
}

/// Test: Parallel completion
/// Given a parallel group with a failing request and a 3 second wait
/// When the tree runs
/// Then the group returns only after the wait finished, with the failure
#[tokio::test(start_paused = true)]
async fn test_parallel_waits_for_all_children() {
    let api = Arc::new(ScriptedApi::new());
    api.respond(Method::GET, "/api/v1/broken", 500, json!({"errors": "boom"}));
    let scenario = scenario(
        1,
        json!({"parallel": {"tasks": [
            {"request": {"from": 0, "method": "GET", "path": "/api/v1/broken"}},
            {"wait": 3},
        ]}}),
    );
    let tree = tree(&scenario);
    let ctx = context(scenario, api, Arc::new(MemoryLedger::new()));

    let started = Instant::now();
    let err = TaskEngine::new(&tree, &ctx).run().await.unwrap_err();

    assert!(matches!(err, Error::Request { status: 500, .. }));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(tree.state(TaskId(3)), Some(TaskState::Finished));
    assert_eq!(tree.state(TaskId(2)), Some(TaskState::Errored));
    assert_eq!(tree.running_count(), 0);
}

/// Test: Stored values feed later tasks
/// Given a stored channel record
/// When a later request references it by placeholder
/// Then the rendered path carries the stored identifier
#[tokio::test(start_paused = true)]
async fn test_store_feeds_placeholders() {
    let api = Arc::new(ScriptedApi::new());
    api.respond(
        Method::GET,
        "/api/v1/channels/",
        200,
        json!({"channel_identifier": 42, "state": "opened"}),
    );
    let scenario = scenario(
        2,
        json!({"serial": {"tasks": [
            {"store_channel_info": {"from": 0, "to": 1, "key": "ab"}},
            {"request": {
                "from": 1,
                "method": "GET",
                "path": "/api/v1/debug/${store.channel_info.ab.channel_identifier}",
            }},
        ]}}),
    );
    let tree = tree(&scenario);
    let ctx = context(scenario, api.clone(), Arc::new(MemoryLedger::new()));

    TaskEngine::new(&tree, &ctx).run().await.unwrap();

    assert!(api
        .requests()
        .iter()
        .any(|r| r.url == "http://node1/api/v1/debug/42"));
}

/// Test: Unknown task type
/// Given a scenario naming a task type nobody registered
/// When the tree is built
/// Then construction fails before anything runs
#[test]
fn test_unknown_task_type_rejected() {
    let scenario = scenario(1, json!({"serial": {"tasks": [{"teleport": {}}]}}));
    let registry = scenario_player::tasks::TaskRegistry::builtin().unwrap();
    let err = scenario_player::tasks::TaskTree::build(&registry, &scenario).unwrap_err();
    assert!(matches!(err, Error::UnknownTaskType(name) if name == "teleport"));
}
