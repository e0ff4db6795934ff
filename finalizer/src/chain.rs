// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{TxHash, U256};

use crate::types::{RequestKind, SessionKey};

/// A finalize call ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeCall {
    pub kind: RequestKind,
    pub key: SessionKey,
    pub nonce: U256,
    pub gas_price: U256,
}

/// A signed transaction. The hash is known before it is broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedFinalize {
    pub call: FinalizeCall,
    pub tx_hash: TxHash,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReceipt {
    pub tx_hash: TxHash,
    /// True when the transaction executed successfully
    pub status: bool,
    pub block_number: Option<u64>,
    pub transaction_index: u64,
    pub gas_used: Option<U256>,
    pub cumulative_gas_used: U256,
}

impl fmt::Display for FinalizeReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx {:?} block {:?} index {} gas_used {:?} cumulative_gas_used {} status {}",
            self.tx_hash,
            self.block_number,
            self.transaction_index,
            self.gas_used,
            self.cumulative_gas_used,
            if self.status { 1 } else { 0 }
        )
    }
}

/// Why the node refused to accept a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRejection {
    /// Structured JSON-RPC error returned by the node
    Rpc { code: i64, message: String },
    /// Could not reach the node or make sense of its response
    Transport(String),
}

impl ChainRejection {
    pub fn message(&self) -> &str {
        match self {
            ChainRejection::Rpc { message, .. } => message,
            ChainRejection::Transport(message) => message,
        }
    }
}

impl fmt::Display for ChainRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainRejection::Rpc { code, message } => write!(f, "rpc error {}: {}", code, message),
            ChainRejection::Transport(message) => write!(f, "transport error: {}", message),
        }
    }
}

/// Access to the observer chain that hosts the ProofChain contract.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn current_height(&self) -> anyhow::Result<u64>;

    /// Transaction count of the finalizer account
    async fn current_nonce(&self) -> anyhow::Result<U256>;

    async fn current_gas_price(&self) -> anyhow::Result<U256>;

    fn sign_finalize(&self, call: FinalizeCall) -> anyhow::Result<SignedFinalize>;

    async fn send_finalize(&self, tx: &SignedFinalize) -> Result<TxHash, ChainRejection>;

    /// `Ok(None)` if the transaction was not mined before `timeout`.
    async fn await_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> anyhow::Result<Option<FinalizeReceipt>>;
}
