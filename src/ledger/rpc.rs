//! [`Ledger`] over Ethereum JSON-RPC.
//!
//! Transactions are submitted with `eth_sendTransaction` from an operator
//! account unlocked on the RPC node (a development chain); contract calls are
//! encoded by hand since only a handful of fixed signatures are needed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{DeployedToken, GasPrice, GasStrategy, Ledger, TokenDeployment, TxHash, TxReceipt};
use crate::identity::{keccak256, Address};
use crate::{plog_debug, plog_trace, Error, Result};

const DEPLOY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(600);

pub struct JsonRpcLedger {
    client: reqwest::Client,
    url: String,
    operator: Address,
    gas_price: GasPrice,
    token_bytecode: Option<Vec<u8>>,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    pub fn new(url: &str, operator: Address, gas_price: GasPrice) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            operator,
            gas_price,
            token_bytecode: None,
            next_id: AtomicU64::new(1),
        })
    }

    /// Creation bytecode (hex) of the token contract used for fresh deployments.
    pub fn with_token_bytecode(mut self, bytecode_hex: &str) -> Result<Self> {
        let trimmed = bytecode_hex.trim();
        let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
            .map_err(|e| Error::Config(format!("token bytecode is not valid hex: {}", e)))?;
        self.token_bytecode = Some(bytes);
        Ok(self)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        plog_trace!("rpc -> {}", payload);
        let response: Value = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = response.get("error") {
            return Err(Error::Rpc(format!("{} failed: {}", method, error)));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Rpc(format!("{} returned no result", method)))
    }

    async fn effective_gas_price(&self) -> Result<u128> {
        match self.gas_price {
            GasPrice::Fixed(price) => Ok(price as u128),
            GasPrice::Strategy(strategy) => {
                let suggested = parse_quantity(&self.call("eth_gasPrice", json!([])).await?)?;
                Ok(match strategy {
                    GasStrategy::Fast => suggested.saturating_mul(2),
                    GasStrategy::Medium => suggested,
                })
            }
        }
    }

    async fn transact(&self, to: Option<Address>, data: Vec<u8>, value: u128) -> Result<TxHash> {
        let gas_price = self.effective_gas_price().await?;
        let mut tx = json!({
            "from": self.operator.to_hex(),
            "data": format!("0x{}", hex::encode(&data)),
            "value": format!("0x{:x}", value),
            "gasPrice": format!("0x{:x}", gas_price),
        });
        if let Some(to) = to {
            tx["to"] = Value::String(to.to_hex());
        }
        let hash = self.call("eth_sendTransaction", json!([tx])).await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| Error::Rpc("eth_sendTransaction returned a non-string hash".into()))?;
        plog_debug!("Submitted transaction {}", hash);
        Ok(TxHash(hash.to_string()))
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let result = self
            .call(
                "eth_call",
                json!([{"to": to.to_hex(), "data": format!("0x{}", hex::encode(data))}, "latest"]),
            )
            .await?;
        let text = result
            .as_str()
            .ok_or_else(|| Error::Rpc("eth_call returned a non-string result".into()))?;
        hex::decode(text.trim_start_matches("0x"))
            .map_err(|e| Error::Rpc(format!("eth_call returned invalid hex: {}", e)))
    }

    async fn call_uint(&self, to: Address, data: Vec<u8>) -> Result<u128> {
        decode_uint(&self.eth_call(to, data).await?)
    }

    async fn raw_receipt(&self, tx: &TxHash) -> Result<Option<Value>> {
        let receipt = self.call("eth_getTransactionReceipt", json!([tx.0])).await?;
        Ok(if receipt.is_null() { None } else { Some(receipt) })
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    fn operator(&self) -> Address {
        self.operator
    }

    async fn block_number(&self) -> Result<u64> {
        let n = parse_quantity(&self.call("eth_blockNumber", json!([])).await?)?;
        u64::try_from(n).map_err(|_| Error::Rpc("block number out of range".into()))
    }

    async fn balance(&self, account: Address) -> Result<u128> {
        parse_quantity(
            &self
                .call("eth_getBalance", json!([account.to_hex(), "latest"]))
                .await?,
        )
    }

    async fn send_value(&self, to: Address, amount: u128) -> Result<TxHash> {
        self.transact(Some(to), Vec::new(), amount).await
    }

    async fn deploy_token(&self, request: &TokenDeployment) -> Result<DeployedToken> {
        let bytecode = self.token_bytecode.as_ref().ok_or_else(|| {
            Error::Config(
                "token deployment requested but no token_bytecode is configured".to_string(),
            )
        })?;
        let mut data = bytecode.clone();
        data.extend(encode_token_constructor(request));
        let tx = self.transact(None, data, 0).await?;

        let deadline = tokio::time::Instant::now() + DEPLOY_TIMEOUT;
        loop {
            if let Some(receipt) = self.raw_receipt(&tx).await? {
                if receipt_status(&receipt) == Some(false) {
                    return Err(Error::TransactionReverted(tx.0));
                }
                let address = receipt
                    .get("contractAddress")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Rpc("deployment receipt has no contractAddress".into()))?
                    .parse()?;
                let block = receipt
                    .get("blockNumber")
                    .map(parse_quantity)
                    .transpose()?
                    .unwrap_or_default() as u64;
                return Ok(DeployedToken { address, block, tx });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ConfirmationTimeout(vec![tx.0]));
            }
            tokio::time::sleep(DEPLOY_POLL_INTERVAL).await;
        }
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<u128> {
        let mut data = selector("balanceOf(address)").to_vec();
        data.extend(word_address(owner));
        self.call_uint(token, data).await
    }

    async fn mint_token(&self, token: Address, to: Address, amount: u128) -> Result<TxHash> {
        let mut data = selector("mintFor(uint256,address)").to_vec();
        data.extend(word_uint(amount));
        data.extend(word_address(to));
        self.transact(Some(token), data, 0).await
    }

    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<u128> {
        let mut data = selector("allowance(address,address)").to_vec();
        data.extend(word_address(owner));
        data.extend(word_address(spender));
        self.call_uint(token, data).await
    }

    async fn approve(&self, token: Address, spender: Address, amount: u128) -> Result<TxHash> {
        let mut data = selector("approve(address,uint256)").to_vec();
        data.extend(word_address(spender));
        data.extend(word_uint(amount));
        self.transact(Some(token), data, 0).await
    }

    async fn udc_token(&self, udc: Address) -> Result<Address> {
        let out = self.eth_call(udc, selector("token()").to_vec()).await?;
        decode_address(&out)
    }

    async fn udc_total_deposit(&self, udc: Address, beneficiary: Address) -> Result<u128> {
        let mut data = selector("total_deposit(address)").to_vec();
        data.extend(word_address(beneficiary));
        self.call_uint(udc, data).await
    }

    async fn udc_effective_balance(&self, udc: Address, beneficiary: Address) -> Result<u128> {
        let mut data = selector("effectiveBalance(address)").to_vec();
        data.extend(word_address(beneficiary));
        self.call_uint(udc, data).await
    }

    async fn udc_deposit(
        &self,
        udc: Address,
        beneficiary: Address,
        new_total: u128,
    ) -> Result<TxHash> {
        let mut data = selector("deposit(address,uint256)").to_vec();
        data.extend(word_address(beneficiary));
        data.extend(word_uint(new_total));
        self.transact(Some(udc), data, 0).await
    }

    async fn receipt(&self, tx: &TxHash) -> Result<Option<TxReceipt>> {
        let Some(receipt) = self.raw_receipt(tx).await? else {
            return Ok(None);
        };
        let Some(block) = receipt.get("blockNumber").filter(|b| !b.is_null()) else {
            return Ok(None);
        };
        Ok(Some(TxReceipt {
            block_number: parse_quantity(block)? as u64,
            success: receipt_status(&receipt).unwrap_or(true),
        }))
    }
}

fn receipt_status(receipt: &Value) -> Option<bool> {
    receipt
        .get("status")
        .and_then(|s| parse_quantity(s).ok())
        .map(|s| s == 1)
}

fn parse_quantity(value: &Value) -> Result<u128> {
    let text = value
        .as_str()
        .ok_or_else(|| Error::Rpc(format!("expected hex quantity, got {}", value)))?;
    let digits = text.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| Error::Rpc(format!("invalid quantity {}: {}", text, e)))
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn word_address(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&address.0);
    word
}

fn word_uint(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn word_string(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = word_uint(bytes.len() as u128).to_vec();
    out.extend_from_slice(bytes);
    let padding = (32 - bytes.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

/// `constructor(uint256 supply, uint8 decimals, string name, string symbol)`
fn encode_token_constructor(request: &TokenDeployment) -> Vec<u8> {
    let name = word_string(&request.name);
    let symbol = word_string(&request.symbol);
    let mut out = Vec::with_capacity(128 + name.len() + symbol.len());
    out.extend(word_uint(request.initial_supply));
    out.extend(word_uint(request.decimals as u128));
    out.extend(word_uint(128));
    out.extend(word_uint(128 + name.len() as u128));
    out.extend(name);
    out.extend(symbol);
    out
}

fn decode_uint(data: &[u8]) -> Result<u128> {
    if data.len() < 32 {
        return Err(Error::Rpc(format!("expected a 32-byte word, got {} bytes", data.len())));
    }
    if data[..16].iter().any(|b| *b != 0) {
        return Err(Error::Rpc("uint256 value does not fit into 128 bits".into()));
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&data[16..32]);
    Ok(u128::from_be_bytes(raw))
}

fn decode_address(data: &[u8]) -> Result<Address> {
    if data.len() < 32 {
        return Err(Error::Rpc(format!("expected a 32-byte word, got {} bytes", data.len())));
    }
    Address::from_slice(&data[12..32])
}
