use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{plog_debug, Error, Result};

const DEFAULT_CLIENT_BINARY: &str = "raiden";
const DEFAULT_RPC_ENDPOINT: &str = "http://127.0.0.1:8545";
const DEFAULT_NETWORK_ID: u64 = 4321;
const DEFAULT_PASSWORD: &str = "scenario-player";
const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 120;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Player-wide settings shared by every scenario run on this machine.
///
/// Loaded from `~/.scenario-player/player.toml`; command-line flags take
/// precedence over file values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerConfig {
    /// Root under which every scenario gets its working directory.
    pub data_path: Option<String>,
    pub client_binary: Option<String>,
    pub eth_rpc_endpoint: Option<String>,
    /// Unlocked account on the RPC node that pays for funding and deployments.
    pub operator_address: Option<String>,
    pub network_id: Option<u64>,
    /// Password written into every node's password file.
    pub password: Option<String>,
    pub readiness_timeout: Option<u64>,
    pub stop_timeout: Option<u64>,
    /// Hex bytecode of the test token contract, used for fresh deployments.
    pub token_bytecode: Option<String>,
}

impl PlayerConfig {
    pub fn player_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".scenario-player"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::player_dir()?.join("player.toml"))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_path {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::player_dir()?.join("scenarios")),
        }
    }

    pub fn effective_client_binary(&self) -> &str {
        self.client_binary.as_deref().unwrap_or(DEFAULT_CLIENT_BINARY)
    }

    pub fn effective_rpc_endpoint(&self) -> &str {
        self.eth_rpc_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_RPC_ENDPOINT)
    }

    pub fn effective_network_id(&self) -> u64 {
        self.network_id.unwrap_or(DEFAULT_NETWORK_ID)
    }

    pub fn effective_password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_PASSWORD)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(
            self.readiness_timeout
                .unwrap_or(DEFAULT_READINESS_TIMEOUT_SECS),
        )
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        plog_debug!("PlayerConfig::load path={}", path.display());
        if !path.exists() {
            plog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        plog_debug!(
            "Config loaded: client_binary={:?}, eth_rpc_endpoint={:?}, data_path={:?}",
            config.client_binary,
            config.eth_rpc_endpoint,
            config.data_path
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::player_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        plog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
