//! Client process fleet: per-node runners, option validation, the fleet
//! controller and its snapshots.

pub mod controller;
pub mod options;
pub mod runner;
pub mod snapshot;

pub use controller::{FleetTimeouts, NodeController, NodeDirectory, ReadinessBarrier};
pub use runner::{resolve_pfs_address, LaunchSettings, NodeRunner};
pub use snapshot::{SnapshotManager, SnapshotPolicy};
