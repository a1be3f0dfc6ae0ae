//! Save and restore the on-disk state of the whole fleet.
//!
//! A snapshot is one directory per node under `<scenario-dir>/snapshot/`,
//! named like the node's data directory. It is either complete or absent;
//! anything in between is refused. `take` assembles the copy next to the
//! root and renames it into place once every node was copied.

use std::fs;
use std::path::{Path, PathBuf};

use super::controller::NodeController;
use crate::util::blocking;
use crate::{plog, plog_warn, Error, Result};

/// Scenario settings that make a snapshot meaningful across runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotPolicy {
    pub reuse_accounts: bool,
    /// Token address is fixed or reused from `token.info`.
    pub token_pinned: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    root: PathBuf,
    policy: SnapshotPolicy,
}

impl SnapshotManager {
    pub fn new(root: PathBuf, policy: SnapshotPolicy) -> Self {
        Self { root, policy }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sibling directory a snapshot is assembled in before it is moved
    /// into place.
    fn staging(&self) -> PathBuf {
        self.root.with_extension("partial")
    }

    fn pairs(&self, fleet: &NodeController) -> Result<Vec<(PathBuf, PathBuf)>> {
        fleet
            .runners()
            .iter()
            .map(|runner| {
                let data_dir = runner.data_dir().to_path_buf();
                let name = data_dir.file_name().ok_or_else(|| {
                    Error::Snapshot(format!("invalid data directory {}", data_dir.display()))
                })?;
                let target = self.root.join(name);
                Ok((data_dir, target))
            })
            .collect()
    }

    fn check_preconditions(&self, fleet: &mut NodeController) -> Result<()> {
        if !self.policy.reuse_accounts {
            return Err(Error::Snapshot(
                "snapshots require nodes.reuse_accounts".to_string(),
            ));
        }
        if !self.policy.token_pinned {
            return Err(Error::Snapshot(
                "snapshots require token.reuse or a fixed token.address".to_string(),
            ));
        }
        let running = fleet.running_indices();
        if !running.is_empty() {
            return Err(Error::Snapshot(format!(
                "nodes {:?} are still running; stop the fleet first",
                running
            )));
        }
        Ok(())
    }

    /// Whether a complete snapshot exists for `fleet`. A partial snapshot is
    /// an error the operator has to resolve by removing the snapshot root.
    pub fn exists(&self, fleet: &NodeController) -> Result<bool> {
        let pairs = self.pairs(fleet)?;
        let present = pairs.iter().filter(|(_, snap)| snap.is_dir()).count();
        if present == 0 {
            Ok(false)
        } else if present == pairs.len() {
            Ok(true)
        } else {
            Err(Error::Snapshot(format!(
                "partial snapshot ({} of {} nodes) at {}; remove it and run again",
                present,
                pairs.len(),
                self.root.display()
            )))
        }
    }

    /// Copy every node's data directory into the snapshot. Returns `false`
    /// without touching anything when a snapshot already exists.
    pub async fn take(&self, fleet: &mut NodeController) -> Result<bool> {
        self.check_preconditions(fleet)?;
        if self.exists(fleet)? {
            plog_warn!(
                "Snapshot at {} already exists, not retaking",
                self.root.display()
            );
            return Ok(false);
        }
        let pairs = self.pairs(fleet)?;
        let root = self.root.clone();
        let staging = self.staging();
        blocking(move || {
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            let copied = pairs.iter().try_for_each(|(data_dir, snap)| {
                let name = snap.file_name().unwrap_or_default();
                copy_dir(data_dir, &staging.join(name))
            });
            if let Err(e) = copied {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
            if root.exists() {
                fs::remove_dir_all(&root)?;
            }
            fs::rename(&staging, &root)?;
            Ok(())
        })
        .await?;
        plog!("Snapshot taken at {}", self.root.display());
        Ok(true)
    }

    /// Replace every node's data directory with its snapshot copy. Returns
    /// `false` when there is no snapshot.
    pub async fn restore(&self, fleet: &mut NodeController) -> Result<bool> {
        self.check_preconditions(fleet)?;
        if !self.exists(fleet)? {
            plog!("No snapshot at {}", self.root.display());
            return Ok(false);
        }
        let pairs = self.pairs(fleet)?;
        blocking(move || {
            for (data_dir, snap) in &pairs {
                if data_dir.exists() {
                    fs::remove_dir_all(data_dir)?;
                }
                copy_dir(snap, data_dir)?;
            }
            Ok(())
        })
        .await?;
        plog!("Fleet restored from snapshot {}", self.root.display());
        Ok(true)
    }

    pub async fn delete(&self, fleet: &mut NodeController) -> Result<()> {
        self.check_preconditions(fleet)?;
        let root = self.root.clone();
        blocking(move || {
            if root.exists() {
                fs::remove_dir_all(&root)?;
            }
            Ok(())
        })
        .await?;
        plog!("Snapshot {} deleted", self.root.display());
        Ok(())
    }
}

/// Recursive copy of `from` into `to`, creating `to`. Symlinks are copied
/// as the files they point to.
pub(crate) fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        if source.is_dir() {
            copy_dir(&source, &target)?;
        } else {
            fs::copy(&source, &target)?;
        }
    }
    Ok(())
}
