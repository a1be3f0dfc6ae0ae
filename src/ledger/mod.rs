//! Ledger RPC collaborator.
//!
//! The player never signs or encodes full transactions itself beyond what
//! [`JsonRpcLedger`] needs; everything the orchestrator and the tasks need
//! from the chain goes through the [`Ledger`] trait.

mod rpc;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::Address;
use crate::Result;

pub use rpc::JsonRpcLedger;

/// Gas price strategy for submitted transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GasPrice {
    Strategy(GasStrategy),
    /// Fixed price in wei.
    Fixed(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasStrategy {
    /// Twice the node's suggested price.
    Fast,
    /// The node's suggested price.
    Medium,
}

impl Default for GasPrice {
    fn default() -> Self {
        GasPrice::Strategy(GasStrategy::Fast)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub block_number: u64,
    /// False when the transaction was mined but reverted.
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDeployment {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub initial_supply: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedToken {
    pub address: Address,
    pub block: u64,
    pub tx: TxHash,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Account paying for funding and deployments.
    fn operator(&self) -> Address;

    async fn block_number(&self) -> Result<u64>;

    async fn balance(&self, account: Address) -> Result<u128>;

    async fn send_value(&self, to: Address, amount: u128) -> Result<TxHash>;

    /// Deploy the test token and wait until the deployment is mined.
    async fn deploy_token(&self, request: &TokenDeployment) -> Result<DeployedToken>;

    async fn token_balance(&self, token: Address, owner: Address) -> Result<u128>;

    async fn mint_token(&self, token: Address, to: Address, amount: u128) -> Result<TxHash>;

    async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<u128>;

    async fn approve(&self, token: Address, spender: Address, amount: u128) -> Result<TxHash>;

    /// Token the user-deposit contract accepts.
    async fn udc_token(&self, udc: Address) -> Result<Address>;

    async fn udc_total_deposit(&self, udc: Address, beneficiary: Address) -> Result<u128>;

    async fn udc_effective_balance(&self, udc: Address, beneficiary: Address) -> Result<u128>;

    /// Raise `beneficiary`'s total deposit to `new_total`, paid by the operator.
    async fn udc_deposit(&self, udc: Address, beneficiary: Address, new_total: u128)
        -> Result<TxHash>;

    /// `None` while the transaction is pending.
    async fn receipt(&self, tx: &TxHash) -> Result<Option<TxReceipt>>;
}
