pub mod api;
pub mod config;
pub mod definition;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod log;
pub mod node;
pub mod orchestrator;
pub mod store;
pub mod tasks;
pub mod util;

pub use error::{Error, Result};
pub use orchestrator::{RunSummary, ScenarioRunner};
