//! Fleet snapshot integration tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use scenario_player::node::{FleetTimeouts, SnapshotManager, SnapshotPolicy};
use scenario_player::Error;

use crate::fixtures::{fleet, tree_contents, ScriptedApi};

fn policy() -> SnapshotPolicy {
    SnapshotPolicy {
        reuse_accounts: true,
        token_pinned: true,
    }
}

/// Test: Snapshot round trip
/// Given a prepared fleet with node state on disk
/// When a snapshot is taken, the state is mangled and the snapshot restored
/// Then every data directory is byte-identical to when it was taken, and a
/// second take leaves the snapshot alone
#[tokio::test]
async fn test_take_and_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut fleet = fleet(&dir, 2, Arc::new(ScriptedApi::new()), FleetTimeouts::default());
    fleet.prepare().unwrap();
    for runner in fleet.runners() {
        let state = runner.data_dir().join("node").join("db");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("state.db"), vec![runner.index() as u8; 4096]).unwrap();
    }
    let originals: Vec<_> = fleet
        .runners()
        .iter()
        .map(|r| tree_contents(r.data_dir()))
        .collect();

    let snapshots = SnapshotManager::new(dir.path().join("snapshot"), policy());
    assert!(!snapshots.exists(&fleet).unwrap());
    assert!(snapshots.take(&mut fleet).await.unwrap());
    assert!(snapshots.exists(&fleet).unwrap());
    assert_eq!(
        tree_contents(&dir.path().join("snapshot").join("node_0_1")),
        originals[1]
    );

    let node0 = fleet.runners()[0].data_dir().to_path_buf();
    std::fs::write(node0.join("node").join("db").join("state.db"), b"corrupted").unwrap();
    std::fs::write(node0.join("stray.log"), b"after snapshot").unwrap();
    std::fs::remove_dir_all(fleet.runners()[1].data_dir().join("keys")).unwrap();

    // A second take must not overwrite the snapshot with mangled state.
    assert!(!snapshots.take(&mut fleet).await.unwrap());

    assert!(snapshots.restore(&mut fleet).await.unwrap());
    for (runner, original) in fleet.runners().iter().zip(&originals) {
        assert_eq!(&tree_contents(runner.data_dir()), original);
    }

    snapshots.delete(&mut fleet).await.unwrap();
    assert!(!snapshots.exists(&fleet).unwrap());
    assert!(!snapshots.restore(&mut fleet).await.unwrap());
}

/// Test: Snapshot refuses a live fleet
/// Given a running fleet
/// When a snapshot is requested
/// Then it is refused until the fleet is stopped
#[tokio::test]
async fn test_snapshot_requires_stopped_fleet() {
    let dir = TempDir::new().unwrap();
    let timeouts = FleetTimeouts {
        readiness: Duration::from_secs(5),
        stop: Duration::from_secs(5),
        poll: Duration::from_millis(100),
    };
    let mut fleet = fleet(&dir, 1, Arc::new(ScriptedApi::new()), timeouts);
    let snapshots = SnapshotManager::new(dir.path().join("snapshot"), policy());

    fleet.start_and_wait().await.unwrap();
    let err = snapshots.take(&mut fleet).await.unwrap_err();
    assert!(matches!(err, Error::Snapshot(_)));

    fleet.stop().await.unwrap();
    assert!(snapshots.take(&mut fleet).await.unwrap());
}

/// Test: Snapshot needs stable identities
/// Given a scenario without reused accounts
/// When a snapshot is requested
/// Then it is refused as a configuration error
#[tokio::test]
async fn test_snapshot_requires_reused_accounts() {
    let dir = TempDir::new().unwrap();
    let mut fleet = fleet(&dir, 1, Arc::new(ScriptedApi::new()), FleetTimeouts::default());
    let snapshots = SnapshotManager::new(
        dir.path().join("snapshot"),
        SnapshotPolicy {
            reuse_accounts: false,
            token_pinned: true,
        },
    );
    let err = snapshots.take(&mut fleet).await.unwrap_err();
    assert!(err.is_configuration());
}
