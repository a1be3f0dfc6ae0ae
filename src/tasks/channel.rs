//! Leaf tasks that drive a node's payment-channel API.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::context::{Partner, RunContext};
use super::registry::{TaskAction, TaskOutcome};
use super::{config_map, node_index, required, COMMON_KEYS};
use crate::api::Method;
use crate::{plog, Error, Result};

/// `from`/`to` pair shared by every channel task.
#[derive(Debug, Clone)]
struct Endpoints {
    from: usize,
    to: Partner,
}

impl Endpoints {
    fn parse(task: &str, config: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            from: node_index(task, required(task, config, "from")?)?,
            to: Partner::parse(required(task, config, "to")?)?,
        })
    }
}

/// Copy the optional `keys` that are present in `config` into `body`.
fn copy_optional(config: &Map<String, Value>, keys: &[&str], body: &mut Map<String, Value>) {
    for key in keys {
        if let Some(value) = config.get(*key).filter(|v| !v.is_null()) {
            body.insert(key.to_string(), value.clone());
        }
    }
}

#[derive(Debug)]
pub struct OpenChannel {
    endpoints: Endpoints,
    params: Map<String, Value>,
}

impl OpenChannel {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("open_channel", config)?;
        let mut params = Map::new();
        copy_optional(
            map,
            &["total_deposit", "settle_timeout", "reveal_timeout"],
            &mut params,
        );
        Ok(Box::new(Self {
            endpoints: Endpoints::parse("open_channel", map)?,
            params,
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let partner = ctx.partner_address(&self.endpoints.to)?;
        let mut body = ctx
            .render_value(&Value::Object(self.params.clone()))?
            .as_object()
            .cloned()
            .unwrap_or_default();
        body.insert("token_address".into(), json!(ctx.token.to_checksum()));
        body.insert("partner_address".into(), json!(partner.to_checksum()));
        let response = ctx
            .call(
                self.endpoints.from,
                Method::PUT,
                "/api/v1/channels",
                Some(Value::Object(body)),
            )
            .await?;
        plog!("Node {} opened channel with {}", self.endpoints.from, partner);
        Ok(response)
    }
}

#[async_trait]
impl TaskAction for OpenChannel {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        self.execute(ctx).await.into()
    }
}

/// PATCH on an existing channel with a fixed body shape.
async fn patch_channel(ctx: &RunContext, endpoints: &Endpoints, body: Value) -> Result<Value> {
    let partner = ctx.partner_address(&endpoints.to)?;
    let body = ctx.render_value(&body)?;
    ctx.call(
        endpoints.from,
        Method::PATCH,
        &ctx.channel_path(partner),
        Some(body),
    )
    .await
}

#[derive(Debug)]
pub struct CloseChannel {
    endpoints: Endpoints,
}

impl CloseChannel {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("close_channel", config)?;
        Ok(Box::new(Self {
            endpoints: Endpoints::parse("close_channel", map)?,
        }))
    }
}

#[async_trait]
impl TaskAction for CloseChannel {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        patch_channel(ctx, &self.endpoints, json!({"state": "closed"}))
            .await
            .into()
    }
}

#[derive(Debug)]
pub struct Deposit {
    endpoints: Endpoints,
    total_deposit: Value,
}

impl Deposit {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("deposit", config)?;
        Ok(Box::new(Self {
            endpoints: Endpoints::parse("deposit", map)?,
            total_deposit: required("deposit", map, "total_deposit")?.clone(),
        }))
    }
}

#[async_trait]
impl TaskAction for Deposit {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        patch_channel(
            ctx,
            &self.endpoints,
            json!({"total_deposit": self.total_deposit}),
        )
        .await
        .into()
    }
}

#[derive(Debug)]
pub struct Withdraw {
    endpoints: Endpoints,
    total_withdraw: Value,
}

impl Withdraw {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("withdraw", config)?;
        Ok(Box::new(Self {
            endpoints: Endpoints::parse("withdraw", map)?,
            total_withdraw: required("withdraw", map, "total_withdraw")?.clone(),
        }))
    }
}

#[async_trait]
impl TaskAction for Withdraw {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        patch_channel(
            ctx,
            &self.endpoints,
            json!({"total_withdraw": self.total_withdraw}),
        )
        .await
        .into()
    }
}

#[derive(Debug)]
pub struct Transfer {
    endpoints: Endpoints,
    params: Map<String, Value>,
}

impl Transfer {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("transfer", config)?;
        let mut params = Map::new();
        params.insert("amount".into(), required("transfer", map, "amount")?.clone());
        copy_optional(map, &["identifier", "lock_timeout"], &mut params);
        Ok(Box::new(Self {
            endpoints: Endpoints::parse("transfer", map)?,
            params,
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let partner = ctx.partner_address(&self.endpoints.to)?;
        let body = ctx.render_value(&Value::Object(self.params.clone()))?;
        let path = format!(
            "/api/v1/payments/{}/{}",
            ctx.token.to_checksum(),
            partner.to_checksum()
        );
        ctx.call(self.endpoints.from, Method::POST, &path, Some(body))
            .await
    }
}

#[async_trait]
impl TaskAction for Transfer {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        self.execute(ctx).await.into()
    }
}

/// GET the channel and keep the response in the run store under
/// `channel_info.<key>` for later placeholders.
#[derive(Debug)]
pub struct StoreChannelInfo {
    endpoints: Endpoints,
    key: String,
}

impl StoreChannelInfo {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("store_channel_info", config)?;
        let key = required("store_channel_info", map, "key")?
            .as_str()
            .ok_or_else(|| Error::Config("store_channel_info: 'key' must be a string".into()))?
            .to_string();
        Ok(Box::new(Self {
            endpoints: Endpoints::parse("store_channel_info", map)?,
            key,
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let partner = ctx.partner_address(&self.endpoints.to)?;
        let info = ctx
            .call(
                self.endpoints.from,
                Method::GET,
                &ctx.channel_path(partner),
                None,
            )
            .await?;
        ctx.store.put("channel_info", &self.key, info.clone());
        Ok(info)
    }
}

#[async_trait]
impl TaskAction for StoreChannelInfo {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        self.execute(ctx).await.into()
    }
}

/// Raw templated API call: `{from, method, path, body?}`.
#[derive(Debug)]
pub struct RawRequest {
    from: usize,
    method: Method,
    path: String,
    body: Option<Value>,
}

impl RawRequest {
    pub fn build(config: &Value) -> Result<Box<dyn TaskAction>> {
        let map = config_map("request", config)?;
        let method = required("request", map, "method")?
            .as_str()
            .map(str::to_ascii_uppercase)
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or_else(|| Error::Config("request: invalid 'method'".into()))?;
        let path = required("request", map, "path")?
            .as_str()
            .ok_or_else(|| Error::Config("request: 'path' must be a string".into()))?
            .to_string();
        if let Some(extra) = map.keys().find(|k| {
            !COMMON_KEYS.contains(&k.as_str()) && !["from", "method", "path", "body"].contains(&k.as_str())
        }) {
            return Err(Error::Config(format!("request: unexpected key '{}'", extra)));
        }
        Ok(Box::new(Self {
            from: node_index("request", required("request", map, "from")?)?,
            method,
            path,
            body: map.get("body").filter(|v| !v.is_null()).cloned(),
        }))
    }

    async fn execute(&self, ctx: &RunContext) -> Result<Value> {
        let path = ctx.render(&self.path)?;
        let body = self
            .body
            .as_ref()
            .map(|b| ctx.render_value(b))
            .transpose()?;
        ctx.call(self.from, self.method.clone(), &path, body).await
    }
}

#[async_trait]
impl TaskAction for RawRequest {
    async fn run(&self, ctx: &RunContext) -> TaskOutcome {
        self.execute(ctx).await.into()
    }
}
