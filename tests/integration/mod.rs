//! Integration test suite for the scenario player.
//!
//! These tests drive the public API end to end: task trees against a
//! scripted node API, real client processes (a shell stand-in) under the
//! node controller, fleet snapshots on disk, and ledger funding against an
//! in-memory ledger.
//!
//! # Test Categories
//!
//! - `tasks`: task tree execution, retries, timeouts and ordering
//! - `fleet`: process lifecycle and the readiness barrier
//! - `snapshot`: snapshot take/restore round trips
//! - `funding`: idempotent funding and confirmation waits
//! - `player`: whole runs, teardown and operator interrupts
//!
//! # CI Compatibility
//!
//! No real client or ledger is needed; the fake client is a POSIX shell
//! script, so the `fleet`, `snapshot` and `player` tests require `/bin/sh`.

mod fixtures;

mod fleet;
mod funding;
mod player;
mod snapshot;
mod tasks;
