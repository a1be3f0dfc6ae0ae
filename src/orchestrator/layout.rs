//! Persisted per-scenario state on disk.
//!
//! ```text
//! <data-path>/<scenario>/
//!     run_number.txt
//!     seed.txt
//!     token.info
//!     scenario-player.log
//!     node_<run>_<index>/
//!     snapshot/node_<run>_<index>/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identity::{load_or_create_seed, Address};
use crate::{plog, Error, Result};

/// Deployed token remembered between runs when `token.reuse` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub name: String,
    pub address: Address,
    pub block: u64,
}

#[derive(Debug, Clone)]
pub struct ScenarioLayout {
    dir: PathBuf,
}

impl ScenarioLayout {
    pub fn new(data_path: &Path, scenario_name: &str) -> Self {
        Self {
            dir: data_path.join(scenario_name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn run_number_file(&self) -> PathBuf {
        self.dir.join("run_number.txt")
    }

    pub fn seed_file(&self) -> PathBuf {
        self.dir.join("seed.txt")
    }

    pub fn token_info_file(&self) -> PathBuf {
        self.dir.join("token.info")
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join("scenario-player.log")
    }

    pub fn snapshot_root(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    /// Data directory of node `index`; `run_tag` is the run number, or 0
    /// when accounts are reused across runs.
    pub fn node_dir(&self, run_tag: u32, index: usize) -> PathBuf {
        self.dir.join(format!("node_{}_{}", run_tag, index))
    }

    /// Next run number: 0 on the first run, then read-increment-write.
    pub fn next_run_number(&self) -> Result<u32> {
        self.ensure()?;
        let path = self.run_number_file();
        let next = match fs::read_to_string(&path) {
            Ok(text) => {
                let current: u32 = text.trim().parse().map_err(|_| {
                    Error::Config(format!(
                        "{} does not contain a run number: {:?}",
                        path.display(),
                        text.trim()
                    ))
                })?;
                current.checked_add(1).ok_or_else(|| {
                    Error::Config(format!("{} is exhausted at run {}", path.display(), current))
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        fs::write(&path, next.to_string())?;
        plog!("Run number {}", next);
        Ok(next)
    }

    /// Current run number without advancing it.
    pub fn current_run_number(&self) -> Result<Option<u32>> {
        match fs::read_to_string(self.run_number_file()) {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn seed(&self) -> Result<String> {
        self.ensure()?;
        load_or_create_seed(&self.seed_file())
    }

    pub fn load_token_info(&self) -> Result<Option<TokenInfo>> {
        match fs::read_to_string(self.token_info_file()) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_token_info(&self, info: &TokenInfo) -> Result<()> {
        self.ensure()?;
        fs::write(self.token_info_file(), serde_json::to_string_pretty(info)?)?;
        Ok(())
    }
}
