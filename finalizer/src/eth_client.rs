// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ethers::abi::AbiEncode;
use ethers::contract::abigen;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, Bytes, TransactionReceipt, TransactionRequest, TxHash, U256,
};
use ethers::utils::keccak256;
use tap::TapFallible;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainRejection, FinalizeCall, FinalizeReceipt, SignedFinalize};
use crate::types::{RequestKind, SessionKey};

abigen!(
    ProofChain,
    r#"[
        function finalizeAndRewardSpecimenSession(uint64 chainId, uint64 blockHeight) external
        function finalizeAndRewardResultSession(uint64 chainId, uint64 blockHeight) external
    ]"#
);

const PROVIDER_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// [`ChainClient`] for an EVM observer chain, sending legacy transactions signed locally.
pub struct EthChainClient {
    provider: Provider<Http>,
    wallet: LocalWallet,
    proofchain_address: EthAddress,
    gas_limit: U256,
    receipt_poll_interval: Duration,
}

impl EthChainClient {
    /// Connects to `rpc_url` and binds the wallet to the chain id reported by the node.
    pub async fn new(
        rpc_url: &str,
        wallet: LocalWallet,
        proofchain_address: EthAddress,
        gas_limit: u64,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Invalid RPC endpoint {}", rpc_url))?
            .interval(PROVIDER_POLL_INTERVAL);
        let chain_id = provider
            .get_chainid()
            .await
            .context("Failed to query chain id")?
            .as_u64();
        info!(
            "[Chain] Connected to chain {} as {:?}, ProofChain at {:?}",
            chain_id,
            wallet.address(),
            proofchain_address
        );
        Ok(Self::from_parts(
            provider,
            wallet.with_chain_id(chain_id),
            proofchain_address,
            gas_limit,
        ))
    }

    fn from_parts(
        provider: Provider<Http>,
        wallet: LocalWallet,
        proofchain_address: EthAddress,
        gas_limit: u64,
    ) -> Self {
        Self {
            provider,
            wallet,
            proofchain_address,
            gas_limit: U256::from(gas_limit),
            receipt_poll_interval: PROVIDER_POLL_INTERVAL,
        }
    }

    pub fn sender(&self) -> EthAddress {
        self.wallet.address()
    }

    async fn log_balance(&self) {
        match self.provider.get_balance(self.sender(), None).await {
            Ok(balance) => info!("[Chain] Finalizer balance: {}", balance),
            Err(e) => warn!("[Chain] Failed to query finalizer balance: {}", e),
        }
    }
}

pub fn encode_finalize_call(kind: RequestKind, key: SessionKey) -> Bytes {
    let chain_id = key.origin_chain_id;
    let block_height = key.origin_block_height;
    match kind {
        RequestKind::Specimen => FinalizeAndRewardSpecimenSessionCall {
            chain_id,
            block_height,
        }
        .encode(),
        RequestKind::Result => FinalizeAndRewardResultSessionCall {
            chain_id,
            block_height,
        }
        .encode(),
    }
    .into()
}

fn rejection_from_provider_error(e: ProviderError) -> ChainRejection {
    match e.as_error_response() {
        Some(response) => ChainRejection::Rpc {
            code: response.code,
            message: response.message.clone(),
        },
        None => ChainRejection::Transport(e.to_string()),
    }
}

fn finalize_receipt(receipt: TransactionReceipt) -> FinalizeReceipt {
    FinalizeReceipt {
        tx_hash: receipt.transaction_hash,
        status: receipt.status.is_some_and(|s| s.as_u64() == 1),
        block_number: receipt.block_number.map(|n| n.as_u64()),
        transaction_index: receipt.transaction_index.as_u64(),
        gas_used: receipt.gas_used,
        cumulative_gas_used: receipt.cumulative_gas_used,
    }
}

#[async_trait]
impl ChainClient for EthChainClient {
    async fn current_height(&self) -> anyhow::Result<u64> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .context("Failed to query block number")?
            .as_u64())
    }

    async fn current_nonce(&self) -> anyhow::Result<U256> {
        self.provider
            .get_transaction_count(self.sender(), None)
            .await
            .context("Failed to query transaction count")
    }

    async fn current_gas_price(&self) -> anyhow::Result<U256> {
        self.provider
            .get_gas_price()
            .await
            .context("Failed to query gas price")
    }

    fn sign_finalize(&self, call: FinalizeCall) -> anyhow::Result<SignedFinalize> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.sender())
            .to(self.proofchain_address)
            .data(encode_finalize_call(call.kind, call.key))
            .gas(self.gas_limit)
            .gas_price(call.gas_price)
            .nonce(call.nonce)
            .chain_id(self.wallet.chain_id())
            .into();
        let signature = self
            .wallet
            .sign_transaction_sync(&tx)
            .context("Failed to sign finalize transaction")?;
        let raw = tx.rlp_signed(&signature).to_vec();
        let tx_hash = TxHash::from(keccak256(&raw));
        Ok(SignedFinalize { call, tx_hash, raw })
    }

    async fn send_finalize(&self, tx: &SignedFinalize) -> Result<TxHash, ChainRejection> {
        let tx_hash = self
            .provider
            .send_raw_transaction(Bytes::from(tx.raw.clone()))
            .await
            .tap_err(|e| debug!("[Chain] Send of {:?} failed: {:?}", tx.tx_hash, e))
            .map_err(rejection_from_provider_error)?
            .tx_hash();
        info!(
            "[Chain] Sent {} for {} nonce {}",
            tx.call.kind.finalize_method(),
            tx.call.key,
            tx.call.nonce
        );
        self.log_balance().await;
        Ok(tx_hash)
    }

    async fn await_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> anyhow::Result<Option<FinalizeReceipt>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(Some(finalize_receipt(receipt))),
                Ok(None) => {}
                Err(e) => warn!("[Chain] Failed to query receipt of {:?}: {}", tx_hash, e),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.receipt_poll_interval.min(deadline - now)).await;
        }
    }
}
