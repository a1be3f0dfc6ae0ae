//! Setup barriers: transaction confirmation depth and token-network
//! discovery by every node.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiRequest, Method, NodeApi};
use crate::identity::Address;
use crate::ledger::{Ledger, TxHash};
use crate::node::NodeDirectory;
use crate::util::sleep_or_cancel;
use crate::{plog, plog_debug, Error, Result};

/// Polling parameters shared by both barriers.
#[derive(Debug, Clone, Copy)]
pub struct Polling {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Wait until every transaction is mined and buried under `depth` more
/// blocks. A reverted receipt fails immediately.
pub async fn wait_for_confirmations(
    ledger: &dyn Ledger,
    hashes: &[TxHash],
    depth: u64,
    polling: Polling,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut pending: Vec<TxHash> = {
        let mut seen = HashSet::new();
        hashes
            .iter()
            .filter(|h| seen.insert((*h).clone()))
            .cloned()
            .collect()
    };
    if pending.is_empty() {
        return Ok(());
    }
    plog!(
        "Waiting for {} transactions to reach {} confirmations",
        pending.len(),
        depth
    );
    let deadline = Instant::now() + polling.timeout;
    loop {
        let head = ledger.block_number().await?;
        let mut still_pending = Vec::new();
        for tx in pending {
            match ledger.receipt(&tx).await? {
                None => still_pending.push(tx),
                Some(receipt) if !receipt.success => {
                    return Err(Error::TransactionReverted(tx.0));
                }
                Some(receipt) if head >= receipt.block_number.saturating_add(depth) => {
                    plog_debug!("{} confirmed (block {})", tx, receipt.block_number);
                }
                Some(_) => still_pending.push(tx),
            }
        }
        pending = still_pending;
        if pending.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::ConfirmationTimeout(
                pending.into_iter().map(|tx| tx.0).collect(),
            ));
        }
        sleep_or_cancel(polling.interval, cancel).await?;
    }
}

fn lists_token(body: &Value, token: Address) -> bool {
    body.as_array().is_some_and(|items| {
        items.iter().any(|item| {
            item.as_str()
                .is_some_and(|s| s.eq_ignore_ascii_case(&token.to_checksum()))
        })
    })
}

/// Have node 0 register the token network if it does not exist yet.
pub async fn register_token_network(
    api: &dyn NodeApi,
    directory: &NodeDirectory,
    token: Address,
) -> Result<()> {
    let url = format!(
        "{}/api/v1/tokens/{}",
        directory.endpoint(0)?,
        token.to_checksum()
    );
    let lookup = ApiRequest::get(url.clone());
    let response = api.send(lookup.clone()).await?;
    if response.is_success() && !response.body.is_null() {
        plog_debug!("Token network for {} already registered", token);
        return Ok(());
    }
    if response.status != 404 && !response.is_success() {
        response.error_for_status(&lookup)?;
        return Ok(());
    }

    plog!("Registering token network for {}", token);
    let register = ApiRequest::new(Method::PUT, url);
    let response = api.send(register.clone()).await?;
    if response.status == 409 {
        plog_debug!("Token network for {} registered concurrently", token);
        return Ok(());
    }
    response.error_for_status(&register)?;
    Ok(())
}

/// Poll every node's token list until each one reports `token`.
pub async fn wait_for_discovery(
    api: Arc<dyn NodeApi>,
    directory: &NodeDirectory,
    token: Address,
    polling: Polling,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + polling.timeout;
    let waits = (0..directory.len()).map(|index| {
        let api = Arc::clone(&api);
        async move {
            let url = format!("{}/api/v1/tokens", directory.endpoint(index)?);
            loop {
                let found = match api.send(ApiRequest::get(url.clone())).await {
                    Ok(response) => response.is_success() && lists_token(&response.body, token),
                    Err(e) => {
                        plog_debug!("Node {} token list unavailable: {}", index, e);
                        false
                    }
                };
                if found {
                    plog_debug!("Node {} discovered token network {}", index, token);
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(Error::DiscoveryTimeout {
                        index,
                        address: directory.address(index)?.to_checksum(),
                        token: token.to_checksum(),
                        timeout: polling.timeout,
                    });
                }
                sleep_or_cancel(polling.interval, cancel).await?;
            }
        }
    });
    try_join_all(waits).await?;
    plog!("All {} nodes discovered token network {}", directory.len(), token);
    Ok(())
}
