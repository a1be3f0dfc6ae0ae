//! Ledger funding and setup barrier integration tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use scenario_player::api::Method;
use scenario_player::definition::UdcTokenSettings;
use scenario_player::identity::Address;
use scenario_player::ledger::{Ledger, TxHash};
use scenario_player::node::NodeDirectory;
use scenario_player::orchestrator::confirm::{
    register_token_network, wait_for_confirmations, wait_for_discovery, Polling,
};
use scenario_player::orchestrator::funding::{
    check_operator_balance, fund_eth, fund_tokens, plan_udc, resolve_token, submit_udc_deposits,
};
use scenario_player::orchestrator::ScenarioLayout;
use scenario_player::Error;

use crate::fixtures::{scenario, MemoryLedger, ScriptedApi};

const NODES: [Address; 2] = [Address([1; 20]), Address([2; 20])];
const TOKEN: Address = Address([0x70; 20]);

fn polling() -> Polling {
    Polling {
        interval: Duration::from_millis(100),
        timeout: Duration::from_secs(5),
    }
}

fn directory() -> NodeDirectory {
    NodeDirectory {
        addresses: NODES.to_vec(),
        endpoints: vec!["http://node0".into(), "http://node1".into()],
    }
}

/// Test: Funding idempotence
/// Given nodes that already hold at least the minimum ETH and tokens
/// When funding runs
/// Then nothing is submitted to the ledger
#[tokio::test]
async fn test_funding_skips_funded_nodes() {
    let ledger = MemoryLedger::new()
        .with_balance(NODES[0], 200)
        .with_balance(NODES[1], 100)
        .with_token_balance(NODES[0], 5_000)
        .with_token_balance(NODES[1], 9_000);

    assert!(fund_eth(&ledger, &NODES, 100, 500).await.unwrap().is_empty());
    assert!(fund_tokens(&ledger, TOKEN, &NODES, 5_000, 50_000)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(ledger.submissions(), 0);
}

/// Test: Funding tops up only what is missing
/// Given one node below the ETH minimum
/// When funding runs twice
/// Then the first pass tops it up to the target and the second submits nothing
#[tokio::test]
async fn test_funding_tops_up_once() {
    let ledger = MemoryLedger::new()
        .with_balance(NODES[0], 40)
        .with_balance(NODES[1], 1_000);

    let submitted = assert_ok!(fund_eth(&ledger, &NODES, 100, 500).await);
    assert_eq!(submitted.len(), 1);
    assert_eq!(ledger.balance(NODES[0]).await.unwrap(), 500);

    assert!(fund_eth(&ledger, &NODES, 100, 500).await.unwrap().is_empty());
    assert_eq!(ledger.submissions(), 1);
}

/// Test: Operator balance gate
/// Given an operator holding less than the configured minimum
/// When the run is checked
/// Then the error reports the shortfall
#[tokio::test]
async fn test_operator_shortfall() {
    let ledger = MemoryLedger::new().with_balance(Address([0xee; 20]), 3);
    let err = assert_err!(check_operator_balance(&ledger, 10).await);
    assert!(matches!(
        err,
        Error::InsufficientBalance {
            balance: 3,
            required: 10,
            shortfall: 7
        }
    ));
    assert_eq!(check_operator_balance(&ledger, 3).await.unwrap(), 3);
}

/// Test: User deposits
/// Given two nodes without user deposits
/// When the deposit plan is made and submitted
/// Then the operator mints and approves once, and one deposit per node follows
#[tokio::test]
async fn test_udc_plan_and_deposits() {
    let ledger = MemoryLedger::new();
    let udc = Address([0x55; 20]);
    let settings = UdcTokenSettings {
        deposit: true,
        balance_per_node: 100,
        min_balance: 50,
    };

    let plan = plan_udc(&ledger, udc, &settings, &NODES).await.unwrap();
    assert_eq!(plan.preparation.len(), 2);
    assert_eq!(plan.deposits, vec![(NODES[0], 100), (NODES[1], 100)]);

    let deposits = submit_udc_deposits(&ledger, udc, &plan).await.unwrap();
    assert_eq!(deposits.len(), 2);
    assert_eq!(ledger.submissions(), 4);

    let disabled = UdcTokenSettings {
        deposit: false,
        ..settings
    };
    let plan = plan_udc(&ledger, udc, &disabled, &NODES).await.unwrap();
    assert!(plan.preparation.is_empty() && plan.deposits.is_empty());
}

/// Test: Token reuse
/// Given a scenario that reuses its token
/// When the token is resolved on two runs
/// Then it is deployed once and read back from token.info afterwards
#[tokio::test]
async fn test_token_deployed_once_when_reused() {
    let dir = TempDir::new().unwrap();
    let mut definition = scenario(1, json!({"wait": 1}));
    definition.token.reuse = true;
    let layout = ScenarioLayout::new(dir.path(), &definition.name);
    layout.ensure().unwrap();
    let ledger = MemoryLedger::new();

    let first = resolve_token(&ledger, &layout, &definition, 0).await.unwrap();
    assert!(first.deployed.is_some());
    assert_eq!(first.address, TOKEN);

    let second = resolve_token(&ledger, &layout, &definition, 1).await.unwrap();
    assert!(second.deployed.is_none());
    assert_eq!(second.address, TOKEN);
    assert_eq!(ledger.submissions(), 1);
}

/// Test: Confirmation barrier
/// Given submitted transactions
/// When the barrier waits for two confirmations
/// Then it returns once the head is deep enough, and fails on a revert
#[tokio::test]
async fn test_confirmations() {
    let ledger = MemoryLedger::new();
    let cancel = CancellationToken::new();
    let hashes = fund_eth(&ledger, &NODES, 100, 500).await.unwrap();
    let mut duplicated = hashes.clone();
    duplicated.extend(hashes);

    assert_ok!(wait_for_confirmations(&ledger, &duplicated, 2, polling(), &cancel).await);

    let reverted = vec![TxHash("0xdead".into())];
    let err = wait_for_confirmations(&ledger, &reverted, 0, polling(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransactionReverted(tx) if tx == "0xdead"));
}

/// Test: Confirmation timeout
/// Given transactions the ledger never mines
/// When the barrier waits for them
/// Then it gives up after its timeout and names every outstanding hash
#[tokio::test(start_paused = true)]
async fn test_confirmation_timeout_names_pending() {
    let ledger = MemoryLedger::new().never_mining();
    let cancel = CancellationToken::new();
    let hashes = assert_ok!(fund_eth(&ledger, &NODES, 100, 500).await);
    assert_eq!(hashes.len(), 2);

    let err = assert_err!(wait_for_confirmations(&ledger, &hashes, 1, polling(), &cancel).await);
    match err {
        Error::ConfirmationTimeout(pending) => {
            let expected: Vec<String> = hashes.iter().map(|tx| tx.0.clone()).collect();
            assert_eq!(pending, expected);
        }
        other => panic!("unexpected error: {}", other),
    }
}

/// Test: Token network registration
/// Given a token network node 0 does not know yet
/// When registration runs
/// Then node 0 registers it exactly once
#[tokio::test]
async fn test_register_token_network() {
    let api = ScriptedApi::new();
    api.respond(Method::GET, "/api/v1/tokens/", 404, json!({"errors": "unknown"}));
    api.respond(Method::PUT, "/api/v1/tokens/", 201, json!({"token_network_address": "0x01"}));

    assert_ok!(register_token_network(&api, &directory(), TOKEN).await);
    assert_eq!(api.count(&Method::PUT, "http://node0/api/v1/tokens/"), 1);

    let known = ScriptedApi::new();
    known.respond(Method::GET, "/api/v1/tokens/", 200, json!("0x0000000000000000000000000000000000000001"));
    register_token_network(&known, &directory(), TOKEN).await.unwrap();
    assert_eq!(known.count(&Method::PUT, "/api/v1/tokens/"), 0);
}

/// Test: Discovery barrier
/// Given node 1 lists the token only on its third poll
/// When the barrier waits for discovery
/// Then it succeeds; a node that never lists it is named in the timeout
#[tokio::test(start_paused = true)]
async fn test_discovery() {
    let listed = json!([TOKEN.to_checksum()]);
    let api = Arc::new(ScriptedApi::new());
    api.respond_seq(
        Method::GET,
        "http://node1/api/v1/tokens",
        vec![(200, json!([])), (200, json!([])), (200, listed.clone())],
    );
    api.respond(Method::GET, "http://node0/api/v1/tokens", 200, listed.clone());
    let cancel = CancellationToken::new();
    wait_for_discovery(api.clone(), &directory(), TOKEN, polling(), &cancel)
        .await
        .unwrap();
    assert_eq!(api.count(&Method::GET, "http://node1/api/v1/tokens"), 3);

    let stuck = Arc::new(ScriptedApi::new());
    stuck.respond(Method::GET, "http://node0/api/v1/tokens", 200, listed);
    stuck.respond(Method::GET, "http://node1/api/v1/tokens", 200, json!([]));
    let err = wait_for_discovery(stuck, &directory(), TOKEN, polling(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DiscoveryTimeout { index: 1, .. }));
}
