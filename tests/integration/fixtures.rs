//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted, recording node API
//! - An in-memory ledger that counts submitted transactions
//! - A fake client executable and fleets built around it
//! - Run contexts and task trees

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use scenario_player::api::{ApiRequest, ApiResponse, Method, NodeApi};
use scenario_player::definition::ScenarioDefinition;
use scenario_player::identity::{derive_identity, Address};
use scenario_player::ledger::{DeployedToken, Ledger, TokenDeployment, TxHash, TxReceipt};
use scenario_player::node::{
    FleetTimeouts, LaunchSettings, NodeController, NodeDirectory, NodeRunner, SnapshotManager,
    SnapshotPolicy,
};
use scenario_player::store::RunStore;
use scenario_player::tasks::{RunContext, TaskRegistry, TaskTree};
use scenario_player::{Error, Result};

/// One request as the node API saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

struct Rule {
    method: Method,
    fragment: String,
    responses: Vec<(u16, Value)>,
    served: usize,
}

/// Node API answering from per-path scripts and recording every request.
///
/// A rule matches when the method is equal and the URL contains the
/// fragment. Its responses are served in order; the last one repeats.
/// Unmatched requests get `200 {"status": "ready"}`.
#[derive(Default)]
pub struct ScriptedApi {
    rules: Mutex<Vec<Rule>>,
    requests: Mutex<Vec<Recorded>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: Method, fragment: &str, status: u16, body: Value) {
        self.respond_seq(method, fragment, vec![(status, body)]);
    }

    pub fn respond_seq(&self, method: Method, fragment: &str, responses: Vec<(u16, Value)>) {
        self.rules.lock().unwrap().push(Rule {
            method,
            fragment: fragment.to_string(),
            responses,
            served: 0,
        });
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &Method, fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| &r.method == method && r.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl NodeApi for ScriptedApi {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.requests.lock().unwrap().push(Recorded {
            method: request.method.clone(),
            url: request.url.clone(),
            body: request.body.clone(),
        });
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| r.method == request.method && request.url.contains(&r.fragment));
        match rule {
            Some(rule) => {
                let index = rule.served.min(rule.responses.len() - 1);
                rule.served += 1;
                let (status, body) = rule.responses[index].clone();
                Ok(ApiResponse::new(status, body))
            }
            None => Ok(ApiResponse::new(200, json!({"status": "ready"}))),
        }
    }
}

/// Ledger kept in memory. Every mined transaction lands in block 1 and the
/// head advances by one per `block_number` call. With `unmined` no receipt
/// is ever returned.
#[derive(Default)]
pub struct MemoryLedger {
    pub balances: Mutex<HashMap<Address, u128>>,
    pub token_balances: Mutex<HashMap<Address, u128>>,
    pub submissions: AtomicUsize,
    pub head: AtomicU64,
    pub unmined: bool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, account: Address, balance: u128) -> Self {
        self.balances.lock().unwrap().insert(account, balance);
        self
    }

    pub fn with_token_balance(self, account: Address, balance: u128) -> Self {
        self.token_balances.lock().unwrap().insert(account, balance);
        self
    }

    pub fn never_mining(mut self) -> Self {
        self.unmined = true;
        self
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn submit(&self) -> TxHash {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        TxHash(format!("0x{:064x}", n + 1))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn operator(&self) -> Address {
        Address([0xee; 20])
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.head.fetch_add(1, Ordering::SeqCst))
    }

    async fn balance(&self, account: Address) -> Result<u128> {
        Ok(self.balances.lock().unwrap().get(&account).copied().unwrap_or(0))
    }

    async fn send_value(&self, to: Address, amount: u128) -> Result<TxHash> {
        *self.balances.lock().unwrap().entry(to).or_insert(0) += amount;
        Ok(self.submit())
    }

    async fn deploy_token(&self, _request: &TokenDeployment) -> Result<DeployedToken> {
        Ok(DeployedToken {
            address: Address([0x70; 20]),
            block: 1,
            tx: self.submit(),
        })
    }

    async fn token_balance(&self, _token: Address, owner: Address) -> Result<u128> {
        Ok(self
            .token_balances
            .lock()
            .unwrap()
            .get(&owner)
            .copied()
            .unwrap_or(0))
    }

    async fn mint_token(&self, _token: Address, to: Address, amount: u128) -> Result<TxHash> {
        *self.token_balances.lock().unwrap().entry(to).or_insert(0) += amount;
        Ok(self.submit())
    }

    async fn allowance(&self, _token: Address, _owner: Address, _spender: Address) -> Result<u128> {
        Ok(0)
    }

    async fn approve(&self, _token: Address, _spender: Address, _amount: u128) -> Result<TxHash> {
        Ok(self.submit())
    }

    async fn udc_token(&self, _udc: Address) -> Result<Address> {
        Ok(Address([0x71; 20]))
    }

    async fn udc_total_deposit(&self, _udc: Address, _beneficiary: Address) -> Result<u128> {
        Ok(0)
    }

    async fn udc_effective_balance(&self, _udc: Address, _beneficiary: Address) -> Result<u128> {
        Ok(0)
    }

    async fn udc_deposit(&self, _udc: Address, _beneficiary: Address, _total: u128) -> Result<TxHash> {
        Ok(self.submit())
    }

    async fn receipt(&self, tx: &TxHash) -> Result<Option<TxReceipt>> {
        if self.unmined {
            return Ok(None);
        }
        if tx.0.ends_with("dead") {
            return Ok(Some(TxReceipt {
                block_number: 1,
                success: false,
            }));
        }
        Ok(Some(TxReceipt {
            block_number: 1,
            success: true,
        }))
    }
}

/// Shell stand-in for the client: idles until interrupted, exits cleanly on
/// SIGINT, and writes marker files into its working directory on start
/// (`marker.txt`), on interrupt (`stopped.txt`) and on a diagnostics request
/// (`diagnostics.txt`).
pub fn fake_client(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-client");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         trap 'echo stopped > stopped.txt; exit 0' INT TERM\n\
         trap 'echo dumped > diagnostics.txt' USR1\n\
         echo started > marker.txt\n\
         while true; do sleep 0.1; done\n",
    )
    .expect("Failed to write fake client");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to make fake client executable");
    path
}

/// Controller over `count` fake clients with data directories under `dir`.
pub fn fleet(
    dir: &TempDir,
    count: usize,
    api: Arc<dyn NodeApi>,
    timeouts: FleetTimeouts,
) -> NodeController {
    let launch = Arc::new(LaunchSettings {
        binary: fake_client(dir.path()),
        eth_rpc_endpoint: "http://127.0.0.1:8545".to_string(),
        network_id: 4321,
        password: "test".to_string(),
        run_number: 0,
        pfs_url: None,
        udc_address: None,
        default_options: Default::default(),
    });
    let runners = (0..count)
        .map(|index| {
            NodeRunner::new(
                index,
                derive_identity("seed", "integration", None, index).unwrap(),
                dir.path().join("fleet").join(format!("node_0_{}", index)),
                Default::default(),
                Arc::clone(&launch),
            )
            .unwrap()
        })
        .collect();
    NodeController::new(runners, api, timeouts)
}

pub fn scenario(count: usize, root: Value) -> ScenarioDefinition {
    ScenarioDefinition::from_json(
        &json!({"name": "integration", "nodes": {"count": count}, "scenario": root}).to_string(),
    )
    .expect("Failed to parse scenario")
}

pub fn tree(scenario: &ScenarioDefinition) -> TaskTree {
    TaskTree::build(&TaskRegistry::builtin().unwrap(), scenario).expect("Failed to build tree")
}

/// Context over `count` nodes that are never started; node `i` has address
/// `[i + 1; 20]` and endpoint `http://node{i}`.
pub fn context(
    scenario: ScenarioDefinition,
    api: Arc<dyn NodeApi>,
    ledger: Arc<dyn Ledger>,
) -> RunContext {
    let count = scenario.nodes.count;
    let directory = NodeDirectory {
        addresses: (0..count).map(|i| Address([i as u8 + 1; 20])).collect(),
        endpoints: (0..count).map(|i| format!("http://node{}", i)).collect(),
    };
    RunContext {
        scenario: Arc::new(scenario),
        run_number: 1,
        nodes: Arc::new(tokio::sync::Mutex::new(NodeController::new(
            Vec::new(),
            Arc::clone(&api),
            FleetTimeouts::default(),
        ))),
        directory,
        snapshots: SnapshotManager::new(PathBuf::from("unused"), SnapshotPolicy::default()),
        api,
        ledger,
        store: RunStore::new(),
        token: Address([0xaa; 20]),
        udc: None,
        restored_from_snapshot: false,
        cancel: CancellationToken::new(),
        retry_interval: Duration::from_secs(1),
        poll_interval: Duration::from_millis(100),
    }
}

/// Read every file under `dir` into `relative path -> contents`.
pub fn tree_contents(dir: &Path) -> HashMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut HashMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = HashMap::new();
    walk(dir, dir, &mut out);
    out
}

pub fn is_assertion(error: &Error) -> bool {
    matches!(error, Error::Assertion(_))
}
