//! Scenario orchestration: persisted run state, ledger funding, setup
//! barriers and the run itself.

pub mod confirm;
pub mod funding;
pub mod layout;
pub mod player;

pub use layout::{ScenarioLayout, TokenInfo};
pub use player::{resolve_client_binary, RunSummary, RunnerSettings, ScenarioRunner};
