//! Assertion tasks over a node's channel state.
//!
//! A failed check is either a [`CheckFailure::Mismatch`] (the node reports
//! something else than expected; retried while the task's timeout allows)
//! or a [`CheckFailure::Missing`] (the field is absent or malformed; a
//! configuration problem that is never retried).

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::context::{Partner, RunContext};
use super::registry::{TaskAction, TaskOutcome};
use super::{config_map, node_index, required, COMMON_KEYS};
use crate::api::Method;
use crate::identity::Address;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    Mismatch(String),
    Missing(String),
}

impl CheckFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckFailure::Mismatch(_))
    }
}

impl From<CheckFailure> for Error {
    fn from(failure: CheckFailure) -> Self {
        match failure {
            CheckFailure::Mismatch(msg) => Error::Assertion(msg),
            CheckFailure::Missing(msg) => Error::ResponseField(msg),
        }
    }
}

fn as_integer(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Equality as a scenario author means it: numbers and numeric strings
/// compare by value, addresses ignore checksum casing.
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    if let (Some(a), Some(b)) = (as_integer(expected), as_integer(actual)) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (as_float(expected), as_float(actual)) {
        return a == b;
    }
    match (expected.as_str(), actual.as_str()) {
        (Some(a), Some(b)) if Address::is_address_literal(a) && Address::is_address_literal(b) => {
            a.eq_ignore_ascii_case(b)
        }
        _ => false,
    }
}

fn canonical(value: &Value) -> String {
    match (as_integer(value), value) {
        (Some(n), _) => n.to_string(),
        (None, Value::String(s)) => s.clone(),
        (None, other) => other.to_string(),
    }
}

/// Order-insensitive comparison of two value lists.
fn same_multiset(expected: &[Value], actual: &[Value]) -> bool {
    let key = |v: &String| (v.parse::<u128>().ok(), v.clone());
    let mut expected: Vec<String> = expected.iter().map(canonical).collect();
    let mut actual: Vec<String> = actual.iter().map(canonical).collect();
    expected.sort_by_key(key);
    actual.sort_by_key(key);
    expected == actual
}

fn field<'a>(channel: &'a Value, name: &str) -> std::result::Result<&'a Value, CheckFailure> {
    channel
        .get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| CheckFailure::Missing(format!("channel has no field '{}': {}", name, channel)))
}

fn check_fields(
    channel: &Value,
    expected: &Map<String, Value>,
) -> std::result::Result<(), CheckFailure> {
    for (name, want) in expected {
        let got = field(channel, name)?;
        if !values_match(want, got) {
            return Err(CheckFailure::Mismatch(format!(
                "{}: expected {}, got {}",
                name, want, got
            )));
        }
    }
    Ok(())
}

/// Missing channel (404) is a mismatch: the node may not know it yet.
fn not_found_as_mismatch(result: Result<Value>, what: &str) -> Result<Value> {
    match result {
        Err(Error::Request { status: 404, .. }) => {
            Err(CheckFailure::Mismatch(format!("{} not found", what)).into())
        }
        other => other,
    }
}

/// `{from, to, <field>: <expected>...}` against a single channel.
#[derive(Debug)]
pub struct AssertChannel {
    from: usize,
    to: Partner,
    expected: Map<String, Value>,
}

impl AssertChannel {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("assert", config)?;
        let expected: Map<String, Value> = map
            .iter()
            .filter(|(k, _)| !COMMON_KEYS.contains(&k.as_str()) && *k != "from" && *k != "to")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if expected.is_empty() {
            return Err(Error::Config("assert: no fields to check".into()));
        }
        Ok(Box::new(Self {
            from: node_index("assert", required("assert", map, "from")?)?,
            to: Partner::parse(required("assert", map, "to")?)?,
            expected,
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let partner = ctx.partner_address(&self.to)?;
        let expected = ctx
            .render_value(&Value::Object(self.expected.clone()))?
            .as_object()
            .cloned()
            .unwrap_or_default();
        let channel = not_found_as_mismatch(
            ctx.call(self.from, Method::GET, &ctx.channel_path(partner), None)
                .await,
            &format!("channel {} -> {}", self.from, partner),
        )?;
        check_fields(&channel, &expected)?;
        Ok(channel)
    }
}

#[async_trait]
impl TaskAction for AssertChannel {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        self.execute(ctx).await.into()
    }
}

async fn channels_of(ctx: &RunContext, from: usize) -> Result<Vec<Value>> {
    let path = format!("/api/v1/channels/{}", ctx.token.to_checksum());
    let response = ctx.call(from, Method::GET, &path, None).await?;
    match response {
        Value::Array(items) => Ok(items),
        other => Err(CheckFailure::Missing(format!("expected a channel list, got {}", other)).into()),
    }
}

fn optional_list(task: &str, map: &Map<String, Value>, key: &str) -> Result<Option<Vec<Value>>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(other) => Err(Error::Config(format!(
            "{}: '{}' must be a list, got {}",
            task, key, other
        ))),
    }
}

/// `{from, channel_count?, balances?, total_deposits?, states?}` over all of
/// a node's channels for the scenario token. Lists compare order-insensitively.
#[derive(Debug)]
pub struct AssertAll {
    from: usize,
    channel_count: Option<usize>,
    lists: Vec<(&'static str, Vec<Value>)>,
}

impl AssertAll {
    const LISTS: [(&'static str, &'static str); 3] = [
        ("balances", "balance"),
        ("total_deposits", "total_deposit"),
        ("states", "state"),
    ];

    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("assert_all", config)?;
        let channel_count = match map.get("channel_count") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().map(|n| n as usize).ok_or_else(|| {
                Error::Config("assert_all: channel_count must be an integer".into())
            })?),
        };
        let mut lists = Vec::new();
        for (key, field) in Self::LISTS {
            if let Some(values) = optional_list("assert_all", map, key)? {
                lists.push((field, values));
            }
        }
        if channel_count.is_none() && lists.is_empty() {
            return Err(Error::Config("assert_all: nothing to check".into()));
        }
        Ok(Box::new(Self {
            from: node_index("assert_all", required("assert_all", map, "from")?)?,
            channel_count,
            lists,
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let channels = channels_of(ctx, self.from).await?;
        if let Some(count) = self.channel_count {
            if channels.len() != count {
                return Err(CheckFailure::Mismatch(format!(
                    "node {} has {} channels, expected {}",
                    self.from,
                    channels.len(),
                    count
                ))
                .into());
            }
        }
        for (name, expected) in &self.lists {
            let actual = channels
                .iter()
                .map(|c| field(c, name).cloned())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if !same_multiset(expected, &actual) {
                return Err(CheckFailure::Mismatch(format!(
                    "node {} {}: expected {:?}, got {:?}",
                    self.from,
                    name,
                    expected.iter().map(canonical).collect::<Vec<_>>(),
                    actual.iter().map(canonical).collect::<Vec<_>>()
                ))
                .into());
            }
        }
        Ok(Value::Array(channels))
    }
}

#[async_trait]
impl TaskAction for AssertAll {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        self.execute(ctx).await.into()
    }
}

/// `{from, balance_sum?, total_deposit_sum?}` over a node's channels.
#[derive(Debug)]
pub struct AssertSum {
    from: usize,
    sums: Vec<(&'static str, u128)>,
}

impl AssertSum {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("assert_sum", config)?;
        let mut sums = Vec::new();
        for (key, field) in [("balance_sum", "balance"), ("total_deposit_sum", "total_deposit")] {
            if let Some(value) = map.get(key).filter(|v| !v.is_null()) {
                let expected = as_integer(value).ok_or_else(|| {
                    Error::Config(format!("assert_sum: '{}' must be an integer", key))
                })?;
                sums.push((field, expected));
            }
        }
        if sums.is_empty() {
            return Err(Error::Config("assert_sum: nothing to check".into()));
        }
        Ok(Box::new(Self {
            from: node_index("assert_sum", required("assert_sum", map, "from")?)?,
            sums,
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let channels = channels_of(ctx, self.from).await?;
        for (name, expected) in &self.sums {
            let mut total: u128 = 0;
            for channel in &channels {
                let value = field(channel, name)?;
                let amount = as_integer(value).ok_or_else(|| {
                    CheckFailure::Missing(format!("'{}' is not an integer: {}", name, value))
                })?;
                total = total.saturating_add(amount);
            }
            if total != *expected {
                return Err(CheckFailure::Mismatch(format!(
                    "node {} sum of {}: expected {}, got {}",
                    self.from, name, expected, total
                ))
                .into());
            }
        }
        Ok(Value::Array(channels))
    }
}

#[async_trait]
impl TaskAction for AssertSum {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        self.execute(ctx).await.into()
    }
}
