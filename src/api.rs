//! Client for the nodes' local HTTP API.
//!
//! Everything the player says to a running node goes through [`NodeApi`], so
//! tests can swap the network for a recording fake.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use reqwest::Method;

use crate::{plog_trace, Error, Result};

/// Path of the readiness probe on every node.
pub const STATUS_PATH: &str = "/api/v1/status";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body; `Null` for empty bodies, a string for non-JSON text.
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success response into [`Error::Request`].
    pub fn error_for_status(self, request: &ApiRequest) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::Request {
            method: request.method.to_string(),
            url: request.url.clone(),
            status: self.status,
            body: self.body.to_string(),
        })
    }
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// [`NodeApi`] over real HTTP.
#[derive(Debug, Clone)]
pub struct HttpNodeApi {
    client: reqwest::Client,
}

impl HttpNodeApi {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeApi for HttpNodeApi {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        plog_trace!(
            "{} {} -> {} {}",
            request.method,
            request.url,
            status,
            text
        );
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(ApiResponse { status, body })
    }
}

/// Ask a node whether its API is up and it has finished starting.
pub async fn probe_ready(api: &dyn NodeApi, base_url: &str) -> bool {
    match api.send(ApiRequest::get(format!("{}{}", base_url, STATUS_PATH))).await {
        Ok(response) => {
            response.is_success()
                && response
                    .body
                    .get("status")
                    .and_then(Value::as_str)
                    .map(|s| s == "ready")
                    .unwrap_or(false)
        }
        Err(_) => false,
    }
}
