//! Everything a running task can see: the fleet, the collaborators and the
//! run-scoped store, plus placeholder resolution for task configs.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiRequest, Method, NodeApi};
use crate::definition::ScenarioDefinition;
use crate::identity::Address;
use crate::ledger::Ledger;
use crate::node::{NodeController, NodeDirectory, SnapshotManager};
use crate::store::RunStore;
use crate::{plog_debug, plog_warn, Error, Result};

/// Pause between attempts of a retrying task.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Counterparty of a channel task: another node or a literal address
/// (possibly a placeholder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partner {
    Node(usize),
    Literal(String),
}

impl Partner {
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(|i| Partner::Node(i as usize))
                .ok_or_else(|| Error::Config(format!("invalid node index {}", n))),
            Value::String(s) => match s.parse::<usize>() {
                Ok(index) => Ok(Partner::Node(index)),
                Err(_) => Ok(Partner::Literal(s.clone())),
            },
            other => Err(Error::Config(format!(
                "expected a node index or an address, got {}",
                other
            ))),
        }
    }
}

pub struct RunContext {
    pub scenario: Arc<ScenarioDefinition>,
    pub run_number: u32,
    pub nodes: Arc<Mutex<NodeController>>,
    /// Addresses and endpoints of the fleet, fixed for the run.
    pub directory: NodeDirectory,
    pub snapshots: SnapshotManager,
    pub api: Arc<dyn NodeApi>,
    pub ledger: Arc<dyn Ledger>,
    pub store: RunStore,
    pub token: Address,
    pub udc: Option<Address>,
    /// The fleet came from a snapshot; snapshot tasks skip their subtree.
    pub restored_from_snapshot: bool,
    pub cancel: CancellationToken,
    pub retry_interval: Duration,
    pub poll_interval: Duration,
}

impl RunContext {
    pub fn node_address(&self, index: usize) -> Result<Address> {
        self.directory.address(index)
    }

    pub fn partner_address(&self, partner: &Partner) -> Result<Address> {
        match partner {
            Partner::Node(index) => self.node_address(*index),
            Partner::Literal(text) => self.render(text)?.parse(),
        }
    }

    /// Substitute `${token}`, `${node.N}` and `${store.ns.key.path}`.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for captures in PLACEHOLDER_RE.captures_iter(template) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            match self.placeholder(name.as_str())? {
                Value::String(s) => out.push_str(&s),
                other => out.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Render every string inside `value`. A string that is exactly one
    /// placeholder takes the placeholder's JSON value.
    pub fn render_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => {
                if let Some(captures) = PLACEHOLDER_RE.captures(s) {
                    if let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) {
                        if whole.start() == 0 && whole.end() == s.len() {
                            return self.placeholder(name.as_str());
                        }
                    }
                }
                Ok(Value::String(self.render(s)?))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    rendered.insert(key.clone(), self.render_value(item)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    fn placeholder(&self, name: &str) -> Result<Value> {
        let name = name.trim();
        if name == "token" {
            return Ok(Value::String(self.token.to_checksum()));
        }
        if name == "udc" {
            return self
                .udc
                .map(|a| Value::String(a.to_checksum()))
                .ok_or_else(|| Error::Config("${udc} used but no UDC is configured".to_string()));
        }
        if let Some(index) = name.strip_prefix("node.") {
            let index: usize = index
                .parse()
                .map_err(|_| Error::Config(format!("invalid placeholder ${{{}}}", name)))?;
            return Ok(Value::String(self.node_address(index)?.to_checksum()));
        }
        if let Some(path) = name.strip_prefix("store.") {
            return self.store.resolve(path).ok_or_else(|| {
                Error::Config(format!("nothing stored under ${{{}}}", name))
            });
        }
        Err(Error::Config(format!("unknown placeholder ${{{}}}", name)))
    }

    /// Path of the channel between `from`'s view and `partner`.
    pub fn channel_path(&self, partner: Address) -> String {
        format!(
            "/api/v1/channels/{}/{}",
            self.token.to_checksum(),
            partner.to_checksum()
        )
    }

    /// Issue one request against node `from`'s API. Non-success responses
    /// become [`Error::Request`], which is retryable only for 503.
    pub async fn call(
        &self,
        from: usize,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.directory.endpoint(from)?, path);
        let mut request = ApiRequest::new(method, url);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        plog_debug!("node {} -> {} {}", from, request.method, request.url);
        let response = self.api.send(request.clone()).await?;
        Ok(response.error_for_status(&request)?.body)
    }

    /// Ask every live node to dump diagnostics. Skipped while another task
    /// holds the fleet.
    pub fn capture_diagnostics(&self) {
        match self.nodes.try_lock() {
            Ok(mut nodes) => nodes.capture_diagnostics(),
            Err(_) => plog_warn!("Fleet busy, skipping node diagnostics"),
        }
    }
}
