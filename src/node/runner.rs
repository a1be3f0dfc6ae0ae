//! One client process and the player-side state tracking it.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::process::{Child, Command};

use super::options;
use crate::identity::{Address, NodeIdentity};
use crate::{plog, plog_debug, plog_warn, Error, Result};

const PFS_OPTION: &str = "pathfinding-service-address";
const API_OPTION: &str = "api-address";

/// Launch parameters shared by every runner of a fleet.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub binary: PathBuf,
    pub eth_rpc_endpoint: String,
    pub network_id: u64,
    pub password: String,
    pub run_number: u32,
    /// Scenario-wide path-finding service, used when no option overrides it.
    pub pfs_url: Option<String>,
    pub udc_address: Option<Address>,
    /// `nodes.default_options` of the scenario.
    pub default_options: Map<String, Value>,
}

/// Path-finding service address: node override, then scenario default
/// override, then the global scenario setting.
pub fn resolve_pfs_address(
    node_options: &Map<String, Value>,
    default_options: &Map<String, Value>,
    global: Option<&str>,
) -> Option<String> {
    node_options
        .get(PFS_OPTION)
        .or_else(|| default_options.get(PFS_OPTION))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| global.map(str::to_string))
}

pub struct NodeRunner {
    index: usize,
    identity: NodeIdentity,
    data_dir: PathBuf,
    api_address: String,
    node_options: Map<String, Value>,
    launch: Arc<LaunchSettings>,
    child: Option<Child>,
}

impl NodeRunner {
    /// Create a runner for node `index`. Options are validated here so a bad
    /// scenario fails before any process is spawned.
    pub fn new(
        index: usize,
        identity: NodeIdentity,
        data_dir: PathBuf,
        node_options: Map<String, Value>,
        launch: Arc<LaunchSettings>,
    ) -> Result<Self> {
        options::validate(index, &launch.default_options)?;
        options::validate(index, &node_options)?;

        let configured_api = node_options
            .get(API_OPTION)
            .or_else(|| launch.default_options.get(API_OPTION))
            .and_then(Value::as_str)
            .map(str::to_string);
        let api_address = match configured_api {
            Some(address) => address,
            None => format!("127.0.0.1:{}", free_port()?),
        };

        Ok(Self {
            index,
            identity,
            data_dir,
            api_address,
            node_options,
            launch,
            child: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn api_address(&self) -> &str {
        &self.api_address
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.api_address)
    }

    pub fn keystore_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn password_file(&self) -> PathBuf {
        self.data_dir.join("password.txt")
    }

    fn run_tag(&self) -> String {
        format!("run-{:03}", self.launch.run_number)
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join(format!("{}.log", self.run_tag()))
    }

    /// Default options overlaid with this node's own options.
    pub fn options(&self) -> Map<String, Value> {
        let mut merged = self.launch.default_options.clone();
        for (key, value) in &self.node_options {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Merge `updates` into the node's options. Takes effect on next start.
    pub fn update_options(&mut self, updates: Map<String, Value>) -> Result<()> {
        if updates.contains_key(API_OPTION) {
            return Err(Error::InvalidNodeOption {
                index: self.index,
                option: API_OPTION.to_string(),
                reason: "cannot be changed after the fleet was created".to_string(),
            });
        }
        let mut candidate = self.node_options.clone();
        for (key, value) in updates {
            candidate.insert(key, value);
        }
        options::validate(self.index, &candidate)?;
        self.node_options = candidate;
        plog_debug!("Node {} options updated: {:?}", self.index, self.node_options);
        Ok(())
    }

    /// Create the data directory, keystore and password file.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        self.identity.write_keystore(&self.keystore_dir())?;
        fs::write(self.password_file(), &self.launch.password)?;
        Ok(())
    }

    pub fn command_line(&self) -> Vec<String> {
        let options = self.options();
        let mut args: Vec<String> = vec![
            "--datadir".into(),
            self.data_dir.display().to_string(),
            "--keystore-path".into(),
            self.keystore_dir().display().to_string(),
            "--address".into(),
            self.address().to_checksum(),
            "--password-file".into(),
            self.password_file().display().to_string(),
            "--network-id".into(),
            self.launch.network_id.to_string(),
            "--eth-rpc-endpoint".into(),
            self.launch.eth_rpc_endpoint.clone(),
            "--log-file".into(),
            self.log_file().display().to_string(),
            "--log-json".into(),
            "--api-address".into(),
            self.api_address.clone(),
        ];
        if !options.contains_key("environment-type") {
            args.extend(["--environment-type".into(), "development".into()]);
        }
        if !options.contains_key("log-config") {
            args.extend(["--log-config".into(), "raiden:DEBUG".into()]);
        }
        if let Some(pfs) = resolve_pfs_address(
            &self.node_options,
            &self.launch.default_options,
            self.launch.pfs_url.as_deref(),
        ) {
            args.extend([format!("--{}", PFS_OPTION), pfs]);
        }
        if let Some(udc) = self.launch.udc_address {
            args.extend([
                "--user-deposit-contract-address".into(),
                udc.to_checksum(),
            ]);
        }
        for (key, value) in &options {
            if key == API_OPTION || key == PFS_OPTION {
                continue;
            }
            options::render(key, value, &mut args);
        }
        args
    }

    /// Spawn the client process. A node that is already running is left alone.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            plog_debug!("Node {} already running", self.index);
            return Ok(());
        }
        self.prepare()?;

        let stdout = self.open_output("stdout")?;
        let stderr = self.open_output("stderr")?;
        let args = self.command_line();
        plog_debug!(
            "Node {} spawn: {} {}",
            self.index,
            self.launch.binary.display(),
            args.join(" ")
        );
        let child = Command::new(&self.launch.binary)
            .args(&args)
            .current_dir(&self.data_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| Error::NodeSpawn {
                index: self.index,
                reason: format!("{}: {}", self.launch.binary.display(), e),
            })?;
        plog!(
            "Node {} started (pid {:?}, api {})",
            self.index,
            child.id(),
            self.api_address
        );
        self.child = Some(child);
        Ok(())
    }

    fn open_output(&self, stream: &str) -> Result<Stdio> {
        let path = self
            .data_dir
            .join(format!("{}.{}.log", self.run_tag(), stream));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Stdio::from(file))
    }

    /// Interrupt the process and wait for it to exit. Exceeding `timeout` is
    /// an error; the process is not killed as a fallback.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            self.child = None;
            return Ok(());
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        if let Some(pid) = child.id() {
            send_signal(pid, libc::SIGINT)?;
        }
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                plog!("Node {} stopped ({})", self.index, status);
                self.child = None;
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                plog_warn!("Node {} did not stop within {:?}", self.index, timeout);
                Err(Error::NodeStop {
                    index: self.index,
                    timeout,
                })
            }
        }
    }

    /// Kill the process outright.
    pub async fn kill(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
            plog!("Node {} killed", self.index);
        }
        Ok(())
    }

    /// OS-level liveness of the process, polled now.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Send `signal` to the live process, if any.
    pub fn signal(&mut self, signal: i32) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if let Some(pid) = self.child.as_ref().and_then(Child::id) {
            send_signal(pid, signal)?;
        }
        Ok(())
    }
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) -> Result<()> {
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are only supported on unix",
    )))
}
