// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction submitter
//!
//! Sends finalize calls from a single account. The local nonce and any escalated gas price live
//! behind one lock that is held for a whole attempt (sign, send, wait for receipt), so two sends
//! can never share a nonce.
//!
//! Per attempt:
//! - mined with success status: nonce consumed, done
//! - mined with failure status: nonce consumed, logged, done (still counts as dispatched)
//! - not mined in time: gas price raised by 15% and kept as a floor for every later send,
//!   immediate retry
//! - `nonce too low`: wait for the mempool to drain, refetch the nonce, immediate retry
//! - `already finalized` / `cannot be finalized`: someone got there first, done
//! - anything else: error, retried with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ethers::types::U256;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chain::{ChainClient, ChainRejection, FinalizeCall, FinalizeReceipt};
use crate::error::FinalizerError;
use crate::retry::{retry_with_backoff, Attempt, RetryPolicy};
use crate::types::{RequestKind, SessionKey};

const GAS_ESCALATION_NUMERATOR: u64 = 115;
const GAS_ESCALATION_DENOMINATOR: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Mined(FinalizeReceipt),
    /// Mined but reverted. The nonce is spent and the call is not retried here.
    Reverted(FinalizeReceipt),
    /// The contract reports the session as already finalized
    AlreadyResolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitterConfig {
    pub kind: RequestKind,
    /// How long to wait for a sent transaction to be mined
    pub receipt_timeout: Duration,
    /// Pause after a `nonce too low` rejection before refetching the nonce
    pub nonce_refresh_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            kind: RequestKind::default(),
            receipt_timeout: Duration::from_secs(60),
            nonce_refresh_delay: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct TxState {
    nonce: Option<U256>,
    // Never cleared; the node's price is only used when it is higher
    escalated_gas_price: Option<U256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectionClass {
    NonceTooLow,
    AlreadyResolved,
    Other,
}

fn classify_rejection(rejection: &ChainRejection) -> RejectionClass {
    let ChainRejection::Rpc { message, .. } = rejection else {
        return RejectionClass::Other;
    };
    let message = message.to_ascii_lowercase();
    if message.contains("nonce too low") {
        RejectionClass::NonceTooLow
    } else if message.contains("already finalized") || message.contains("cannot be finalized") {
        RejectionClass::AlreadyResolved
    } else {
        RejectionClass::Other
    }
}

pub fn escalate_gas_price(gas_price: U256) -> U256 {
    gas_price.saturating_mul(U256::from(GAS_ESCALATION_NUMERATOR))
        / U256::from(GAS_ESCALATION_DENOMINATOR)
}

pub struct TransactionSubmitter<C> {
    client: Arc<C>,
    config: SubmitterConfig,
    tx_state: Mutex<TxState>,
}

impl<C: ChainClient> TransactionSubmitter<C> {
    pub fn new(client: Arc<C>, config: SubmitterConfig) -> Self {
        Self {
            client,
            config,
            tx_state: Mutex::new(TxState::default()),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.config.kind
    }

    /// Send the finalize call for `key` until it is mined or the retry budget runs out.
    pub async fn submit(&self, key: SessionKey) -> anyhow::Result<FinalizeOutcome> {
        let label = format!("{} {}", self.config.kind.finalize_method(), key);
        retry_with_backoff(&self.config.retry, &label, || self.attempt(key)).await
    }

    /// Current observer-chain height, with the same retry policy as sends.
    pub async fn block_number(&self) -> anyhow::Result<u64> {
        retry_with_backoff(&self.config.retry, "block number", || async {
            Ok::<_, anyhow::Error>(Attempt::Done(self.client.current_height().await?))
        })
        .await
    }

    async fn attempt(&self, key: SessionKey) -> anyhow::Result<Attempt<FinalizeOutcome>> {
        let mut tx_state = self.tx_state.lock().await;

        let nonce = match tx_state.nonce {
            Some(nonce) => nonce,
            None => {
                let nonce = self
                    .client
                    .current_nonce()
                    .await
                    .context("Failed to fetch finalizer nonce")?;
                info!("[Submitter] Fetched nonce {}", nonce);
                tx_state.nonce = Some(nonce);
                nonce
            }
        };
        let network_gas_price = self
            .client
            .current_gas_price()
            .await
            .context("Failed to fetch gas price")?;
        let gas_price = tx_state
            .escalated_gas_price
            .map_or(network_gas_price, |escalated| escalated.max(network_gas_price));

        let signed = self.client.sign_finalize(FinalizeCall {
            kind: self.config.kind,
            key,
            nonce,
            gas_price,
        })?;
        info!(
            "[Submitter] Sending {} for {}: tx {:?} nonce {} gas price {}",
            self.config.kind.finalize_method(),
            key,
            signed.tx_hash,
            nonce,
            gas_price
        );

        let tx_hash = match self.client.send_finalize(&signed).await {
            Ok(tx_hash) => tx_hash,
            Err(rejection) => {
                return match classify_rejection(&rejection) {
                    RejectionClass::NonceTooLow => {
                        warn!(
                            "[Submitter] Bounced tx {:?} for {} with nonce {}: {}",
                            signed.tx_hash, key, nonce, rejection
                        );
                        tokio::time::sleep(self.config.nonce_refresh_delay).await;
                        tx_state.nonce = None;
                        Ok(Attempt::retry_now())
                    }
                    RejectionClass::AlreadyResolved => {
                        info!(
                            "[Submitter] Session {} already resolved on chain: {}",
                            key,
                            rejection.message()
                        );
                        Ok(Attempt::Done(FinalizeOutcome::AlreadyResolved))
                    }
                    RejectionClass::Other => Err(match rejection {
                        ChainRejection::Rpc { code, message } => {
                            FinalizerError::ChainRejected { code, message }
                        }
                        ChainRejection::Transport(message) => FinalizerError::Transport(message),
                    }
                    .into()),
                };
            }
        };

        let receipt = self
            .client
            .await_receipt(tx_hash, self.config.receipt_timeout)
            .await
            .with_context(|| format!("Failed waiting for receipt of {:?}", tx_hash))?;
        match receipt {
            Some(receipt) => {
                tx_state.nonce = Some(nonce + 1);
                if receipt.status {
                    info!("[Submitter] Finalized {}: {}", key, receipt);
                    Ok(Attempt::Done(FinalizeOutcome::Mined(receipt)))
                } else {
                    warn!("[Submitter] Finalize transaction for {} failed: {}", key, receipt);
                    Ok(Attempt::Done(FinalizeOutcome::Reverted(receipt)))
                }
            }
            None => {
                let escalated = escalate_gas_price(gas_price);
                warn!(
                    "[Submitter] tx {:?} for {} not mined within {:?}, raising gas price {} -> {}",
                    tx_hash, key, self.config.receipt_timeout, gas_price, escalated
                );
                tx_state.escalated_gas_price = Some(escalated);
                Ok(Attempt::retry_now())
            }
        }
    }
}
