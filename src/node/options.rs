//! Validation of per-node client options.
//!
//! Options are split into three disjoint sets: options the player always
//! sets itself, options it sets by default but lets the scenario override,
//! and options passed straight through. Anything else is rejected.

use serde_json::{Map, Value};

use crate::{plog_warn, Error, Result};

/// Set by the player from the run layout; overriding them is an error.
pub const ALWAYS_MANAGED: &[&str] = &[
    "datadir",
    "keystore-path",
    "address",
    "password-file",
    "network-id",
    "eth-rpc-endpoint",
    "log-file",
    "log-json",
    "user-deposit-contract-address",
];

/// Set by the player unless the scenario overrides them (with a warning).
pub const OVERRIDABLE: &[&str] = &[
    "api-address",
    "environment-type",
    "log-config",
    "gas-price",
    "pathfinding-service-address",
    "routing-mode",
];

/// Handed to the client untouched.
pub const PASS_THROUGH: &[&str] = &[
    "matrix-server",
    "flat-fee",
    "proportional-fee",
    "proportional-imbalance-fee",
    "default-reveal-timeout",
    "default-settle-timeout",
    "pathfinding-max-paths",
    "pathfinding-max-fee",
    "pathfinding-iou-timeout",
    "blockchain-query-interval",
    "enable-monitoring",
    "cap-mediation-fees",
];

/// Check `options` for node `index`, warning about overrides.
pub fn validate(index: usize, options: &Map<String, Value>) -> Result<()> {
    for key in options.keys() {
        let option = key.as_str();
        if ALWAYS_MANAGED.contains(&option) {
            return Err(Error::InvalidNodeOption {
                index,
                option: key.clone(),
                reason: "managed by the scenario player and cannot be overridden".to_string(),
            });
        }
        if OVERRIDABLE.contains(&option) {
            plog_warn!(
                "Node {}: overriding player-managed option '{}' with {}",
                index,
                option,
                options[key]
            );
            continue;
        }
        if !PASS_THROUGH.contains(&option) {
            return Err(Error::InvalidNodeOption {
                index,
                option: key.clone(),
                reason: "unknown option".to_string(),
            });
        }
    }
    Ok(())
}

/// Render one option as command-line arguments. `true` is a bare flag,
/// `false`/`null` omit the option, arrays repeat it.
pub fn render(key: &str, value: &Value, args: &mut Vec<String>) {
    match value {
        Value::Null | Value::Bool(false) => {}
        Value::Bool(true) => args.push(format!("--{}", key)),
        Value::Array(items) => {
            for item in items {
                render(key, item, args);
            }
        }
        Value::String(s) => {
            args.push(format!("--{}", key));
            args.push(s.clone());
        }
        other => {
            args.push(format!("--{}", key));
            args.push(other.to_string());
        }
    }
}
