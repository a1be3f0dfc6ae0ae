//! Scenario definition as handed over by the scenario loader.
//!
//! The document is validated and defaulted before it reaches the player, so
//! these types only carry serde defaults for optional sections and a few
//! cross-field checks the orchestrator depends on.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::Address;
use crate::ledger::GasPrice;
use crate::util::seconds;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub token: TokenSettings,
    pub nodes: NodeSettings,
    /// Root task; exactly one key naming the task type.
    pub scenario: Map<String, Value>,
}

fn default_version() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Budget for the whole task tree, in seconds.
    pub timeout: Option<f64>,
    pub gas_price: GasPrice,
    pub network_id: Option<u64>,
    pub confirmations: u64,
    pub confirmation_timeout: f64,
    pub discovery_timeout: f64,
    pub poll_interval: f64,
    pub operator_min_balance: u128,
    pub eth_min_balance: u128,
    pub eth_fund_balance: u128,
    /// Post-task delay per task type, in seconds.
    pub sync_delays: HashMap<String, f64>,
    pub services: Services,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: None,
            gas_price: GasPrice::default(),
            network_id: None,
            confirmations: 5,
            confirmation_timeout: 600.0,
            discovery_timeout: 300.0,
            poll_interval: 1.0,
            operator_min_balance: 5_000_000_000_000_000_000,
            eth_min_balance: 100_000_000_000_000_000,
            eth_fund_balance: 500_000_000_000_000_000,
            sync_delays: HashMap::new(),
            services: Services::default(),
        }
    }
}

impl Settings {
    pub fn confirmation_timeout(&self) -> Result<Duration> {
        seconds(self.confirmation_timeout.max(0.0))
    }

    pub fn discovery_timeout(&self) -> Result<Duration> {
        seconds(self.discovery_timeout.max(0.0))
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        seconds(self.poll_interval.max(0.01))
    }

    pub fn run_timeout(&self) -> Result<Option<Duration>> {
        self.timeout.filter(|t| *t > 0.0).map(seconds).transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Services {
    pub pfs: PfsSettings,
    pub udc: UdcSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PfsSettings {
    pub url: Option<String>,
}

/// User-deposit contract (auxiliary deposit mechanism) settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UdcSettings {
    pub enable: bool,
    pub address: Option<Address>,
    pub token: UdcTokenSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdcTokenSettings {
    /// Whether the player deposits on behalf of the nodes.
    pub deposit: bool,
    /// Total deposit each node is topped up to.
    pub balance_per_node: u128,
    /// Nodes below this effective balance get topped up.
    pub min_balance: u128,
}

impl Default for UdcTokenSettings {
    fn default() -> Self {
        Self {
            deposit: true,
            balance_per_node: 5_000,
            min_balance: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Use an already deployed token at this address.
    pub address: Option<Address>,
    /// Deploy once and reuse via `token.info` on later runs.
    pub reuse: bool,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: u8,
    pub balance_min: u128,
    pub balance_fund: u128,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            address: None,
            reuse: false,
            name: None,
            symbol: None,
            decimals: 18,
            balance_min: 5_000,
            balance_fund: 50_000,
        }
    }
}

impl TokenSettings {
    /// True when the token address does not change between runs.
    pub fn is_pinned(&self) -> bool {
        self.reuse || self.address.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub count: usize,
    #[serde(default)]
    pub reuse_accounts: bool,
    #[serde(default)]
    pub restore_snapshot: bool,
    #[serde(default)]
    pub default_options: Map<String, Value>,
    #[serde(default)]
    pub node_options: HashMap<usize, Map<String, Value>>,
}

impl NodeSettings {
    /// Default options overlaid with the options specific to `index`.
    pub fn options_for(&self, index: usize) -> Map<String, Value> {
        let mut merged = self.default_options.clone();
        if let Some(specific) = self.node_options.get(&index) {
            for (key, value) in specific {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

impl ScenarioDefinition {
    /// Parse an already-expanded scenario document.
    pub fn from_json(text: &str) -> Result<Self> {
        let definition: Self = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("malformed scenario: {}", e)))?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load a scenario document; a missing `name` defaults to the file stem.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut raw: Value = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("malformed scenario {}: {}", path.display(), e)))?;
        if let Some(obj) = raw.as_object_mut() {
            if !obj.contains_key("name") {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "scenario".to_string());
                obj.insert("name".to_string(), Value::String(stem));
            }
        }
        Self::from_json(&raw.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        self.root_task()?;
        if self.nodes.count == 0 {
            return Err(Error::Config("nodes.count must be at least 1".to_string()));
        }
        if let Some(bad) = self.nodes.node_options.keys().find(|i| **i >= self.nodes.count) {
            return Err(Error::Config(format!(
                "node_options references node {} but only {} nodes are configured",
                bad, self.nodes.count
            )));
        }
        if self.token.reuse && self.token.address.is_some() {
            return Err(Error::Config(
                "token.reuse and token.address are mutually exclusive".to_string(),
            ));
        }
        if self.settings.services.udc.enable && self.settings.services.udc.address.is_none() {
            return Err(Error::Config(
                "settings.services.udc.enable requires settings.services.udc.address".to_string(),
            ));
        }
        self.settings.confirmation_timeout()?;
        self.settings.discovery_timeout()?;
        self.settings.poll_interval()?;
        self.settings.run_timeout()?;
        for task_type in self.settings.sync_delays.keys() {
            self.sync_delay_for(task_type)?;
        }
        Ok(())
    }

    /// The single root task: its type name and configuration.
    pub fn root_task(&self) -> Result<(&str, &Value)> {
        let mut entries = self.scenario.iter();
        match (entries.next(), entries.next()) {
            (Some((name, config)), None) => Ok((name.as_str(), config)),
            (None, _) => Err(Error::Config("scenario has no root task".to_string())),
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "scenario must have exactly one root task, found {}",
                self.scenario.len()
            ))),
        }
    }

    pub fn sync_delay_for(&self, task_type: &str) -> Result<Option<Duration>> {
        self.settings
            .sync_delays
            .get(task_type)
            .filter(|s| **s >= 0.0)
            .map(|s| seconds(*s))
            .transpose()
    }
}
