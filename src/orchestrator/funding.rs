//! Ledger setup before the scenario runs: operator balance check, token
//! deploy or reuse, and topping up node accounts.
//!
//! Every step reads the current balance or allowance first and submits
//! nothing when the target is already met.

use crate::definition::{ScenarioDefinition, UdcTokenSettings};
use crate::identity::Address;
use crate::ledger::{Ledger, TokenDeployment, TxHash};
use crate::{plog, plog_debug, Error, Result};

use super::layout::{ScenarioLayout, TokenInfo};

/// Fail fast when the operator cannot pay for the run.
pub async fn check_operator_balance(ledger: &dyn Ledger, minimum: u128) -> Result<u128> {
    let balance = ledger.balance(ledger.operator()).await?;
    if balance < minimum {
        return Err(Error::InsufficientBalance {
            balance,
            required: minimum,
            shortfall: minimum - balance,
        });
    }
    plog!("Operator {} balance {}", ledger.operator(), balance);
    Ok(balance)
}

/// Token the scenario runs against, plus any transaction to confirm.
#[derive(Debug, Clone)]
pub struct ScenarioToken {
    pub address: Address,
    pub deployed: Option<TxHash>,
}

/// Fixed address, then `token.info` when reusing, else a fresh deployment
/// (remembered in `token.info` when reusing).
pub async fn resolve_token(
    ledger: &dyn Ledger,
    layout: &ScenarioLayout,
    scenario: &ScenarioDefinition,
    run_number: u32,
) -> Result<ScenarioToken> {
    let settings = &scenario.token;
    if let Some(address) = settings.address {
        plog!("Using fixed token {}", address);
        return Ok(ScenarioToken {
            address,
            deployed: None,
        });
    }
    if settings.reuse {
        if let Some(info) = layout.load_token_info()? {
            plog!("Reusing token {} ({}) from block {}", info.name, info.address, info.block);
            return Ok(ScenarioToken {
                address: info.address,
                deployed: None,
            });
        }
    }

    let name = settings
        .name
        .clone()
        .unwrap_or_else(|| format!("{}-token-{}", scenario.name, run_number));
    let symbol = settings
        .symbol
        .clone()
        .unwrap_or_else(|| format!("T{}", run_number));
    let request = TokenDeployment {
        name: name.clone(),
        symbol,
        decimals: settings.decimals,
        initial_supply: settings
            .balance_fund
            .saturating_mul(scenario.nodes.count as u128),
    };
    let deployed = ledger.deploy_token(&request).await?;
    plog!("Deployed token {} at {} (block {})", name, deployed.address, deployed.block);
    if settings.reuse {
        layout.save_token_info(&TokenInfo {
            name,
            address: deployed.address,
            block: deployed.block,
        })?;
    }
    Ok(ScenarioToken {
        address: deployed.address,
        deployed: Some(deployed.tx),
    })
}

/// Top every node below `minimum` ETH up to `target`.
pub async fn fund_eth(
    ledger: &dyn Ledger,
    nodes: &[Address],
    minimum: u128,
    target: u128,
) -> Result<Vec<TxHash>> {
    let mut submitted = Vec::new();
    for node in nodes {
        let balance = ledger.balance(*node).await?;
        if balance >= minimum {
            plog_debug!("{} has {} wei, no funding needed", node, balance);
            continue;
        }
        let amount = target.max(minimum) - balance;
        submitted.push(ledger.send_value(*node, amount).await?);
        plog!("Funding {} with {} wei", node, amount);
    }
    Ok(submitted)
}

/// Mint scenario tokens to every node below `minimum`, up to `target`.
pub async fn fund_tokens(
    ledger: &dyn Ledger,
    token: Address,
    nodes: &[Address],
    minimum: u128,
    target: u128,
) -> Result<Vec<TxHash>> {
    let mut submitted = Vec::new();
    for node in nodes {
        let balance = ledger.token_balance(token, *node).await?;
        if balance >= minimum {
            plog_debug!("{} holds {} tokens, no minting needed", node, balance);
            continue;
        }
        let amount = target.max(minimum) - balance;
        submitted.push(ledger.mint_token(token, *node, amount).await?);
        plog!("Minting {} tokens for {}", amount, node);
    }
    Ok(submitted)
}

/// Transactions of the user-deposit funding, split so the operator's
/// mint/approve can be confirmed before the deposits that spend them.
#[derive(Debug, Default)]
pub struct UdcFunding {
    pub preparation: Vec<TxHash>,
    /// `(beneficiary, new total deposit)` still to submit.
    pub deposits: Vec<(Address, u128)>,
}

/// Work out what the user-deposit contract still needs and submit the
/// operator-side preparation (mint, approve).
pub async fn plan_udc(
    ledger: &dyn Ledger,
    udc: Address,
    settings: &UdcTokenSettings,
    nodes: &[Address],
) -> Result<UdcFunding> {
    let mut funding = UdcFunding::default();
    if !settings.deposit {
        return Ok(funding);
    }

    let mut required: u128 = 0;
    for node in nodes {
        let effective = ledger.udc_effective_balance(udc, *node).await?;
        if effective >= settings.min_balance {
            plog_debug!("{} has UDC balance {}, no deposit needed", node, effective);
            continue;
        }
        let top_up = settings.balance_per_node.max(settings.min_balance) - effective;
        let total = ledger.udc_total_deposit(udc, *node).await?;
        funding.deposits.push((*node, total + top_up));
        required += top_up;
    }
    if required == 0 {
        return Ok(funding);
    }

    let operator = ledger.operator();
    let udc_token = ledger.udc_token(udc).await?;
    let held = ledger.token_balance(udc_token, operator).await?;
    if held < required {
        plog!("Minting {} UDC tokens for the operator", required - held);
        funding
            .preparation
            .push(ledger.mint_token(udc_token, operator, required - held).await?);
    }
    let allowance = ledger.allowance(udc_token, operator, udc).await?;
    if allowance < required {
        plog!("Approving {} UDC tokens", required);
        funding
            .preparation
            .push(ledger.approve(udc_token, udc, required).await?);
    }
    Ok(funding)
}

/// Submit the deposits planned by [`plan_udc`].
pub async fn submit_udc_deposits(
    ledger: &dyn Ledger,
    udc: Address,
    funding: &UdcFunding,
) -> Result<Vec<TxHash>> {
    let mut submitted = Vec::with_capacity(funding.deposits.len());
    for (beneficiary, total) in &funding.deposits {
        plog!("Depositing into UDC for {} (total {})", beneficiary, total);
        submitted.push(ledger.udc_deposit(udc, *beneficiary, *total).await?);
    }
    Ok(submitted)
}
