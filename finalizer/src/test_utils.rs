// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory chain client and event source for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{TxHash, U256};
use ethers::utils::keccak256;

use crate::chain::{ChainClient, ChainRejection, FinalizeCall, FinalizeReceipt, SignedFinalize};
use crate::source::{EventSource, SessionQuery};
use crate::types::{SessionKey, SessionRecord};

/// How the mock answers a receipt wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptBehavior {
    Success,
    Failure,
    Timeout,
}

#[derive(Clone, Debug)]
pub struct MockChainClient {
    height: Arc<AtomicU64>,
    height_failures: Arc<AtomicU32>,
    nonce: Arc<Mutex<U256>>,
    nonce_queries: Arc<AtomicU32>,
    gas_price: Arc<Mutex<U256>>,
    send_responses: Arc<Mutex<VecDeque<Result<(), ChainRejection>>>>,
    receipt_responses: Arc<Mutex<VecDeque<ReceiptBehavior>>>,
    receipt_delay: Arc<Mutex<Duration>>,
    receipts_delivered: Arc<AtomicU32>,
    sent: Arc<Mutex<Vec<SignedFinalize>>>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            height: Arc::new(AtomicU64::new(0)),
            height_failures: Default::default(),
            nonce: Arc::new(Mutex::new(U256::zero())),
            nonce_queries: Default::default(),
            gas_price: Arc::new(Mutex::new(U256::from(1_000_000_000u64))),
            send_responses: Default::default(),
            receipt_responses: Default::default(),
            receipt_delay: Default::default(),
            receipts_delivered: Default::default(),
            sent: Default::default(),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn fail_next_height_queries(&self, n: u32) {
        self.height_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_nonce(&self, nonce: u64) {
        *self.nonce.lock().unwrap() = U256::from(nonce);
    }

    pub fn nonce_queries(&self) -> u32 {
        self.nonce_queries.load(Ordering::SeqCst)
    }

    pub fn set_gas_price(&self, gas_price: u64) {
        *self.gas_price.lock().unwrap() = U256::from(gas_price);
    }

    /// Queue the result of the next send. Sends are accepted once the queue is empty.
    pub fn push_send_response(&self, response: Result<(), ChainRejection>) {
        self.send_responses.lock().unwrap().push_back(response);
    }

    pub fn push_rpc_rejection(&self, code: i64, message: &str) {
        self.push_send_response(Err(ChainRejection::Rpc {
            code,
            message: message.to_string(),
        }));
    }

    /// Queue the result of the next receipt wait. Receipts succeed once the queue is empty.
    pub fn push_receipt(&self, behavior: ReceiptBehavior) {
        self.receipt_responses.lock().unwrap().push_back(behavior);
    }

    /// Time every receipt wait takes before answering.
    pub fn set_receipt_delay(&self, delay: Duration) {
        *self.receipt_delay.lock().unwrap() = delay;
    }

    /// Receipt waits that ran to completion.
    pub fn receipts_delivered(&self) -> u32 {
        self.receipts_delivered.load(Ordering::SeqCst)
    }

    /// Transactions accepted by the mock, in send order.
    pub fn sent(&self) -> Vec<SignedFinalize> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn current_height(&self) -> anyhow::Result<u64> {
        let failures = self.height_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.height_failures.store(failures - 1, Ordering::SeqCst);
            anyhow::bail!("mock height query failure");
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn current_nonce(&self) -> anyhow::Result<U256> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        Ok(*self.nonce.lock().unwrap())
    }

    async fn current_gas_price(&self) -> anyhow::Result<U256> {
        Ok(*self.gas_price.lock().unwrap())
    }

    fn sign_finalize(&self, call: FinalizeCall) -> anyhow::Result<SignedFinalize> {
        let raw = format!(
            "{}:{}:{}:{}",
            call.kind.finalize_method(),
            call.key,
            call.nonce,
            call.gas_price
        )
        .into_bytes();
        Ok(SignedFinalize {
            tx_hash: TxHash::from(keccak256(&raw)),
            raw,
            call,
        })
    }

    async fn send_finalize(&self, tx: &SignedFinalize) -> Result<TxHash, ChainRejection> {
        let response = self
            .send_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        response?;
        self.sent.lock().unwrap().push(tx.clone());
        Ok(tx.tx_hash)
    }

    async fn await_receipt(
        &self,
        tx_hash: TxHash,
        _timeout: Duration,
    ) -> anyhow::Result<Option<FinalizeReceipt>> {
        let delay = *self.receipt_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.receipts_delivered.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .receipt_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReceiptBehavior::Success);
        if behavior == ReceiptBehavior::Timeout {
            return Ok(None);
        }
        // A mined transaction consumes its nonce
        let tx_nonce = self
            .sent
            .lock()
            .unwrap()
            .iter()
            .find(|tx| tx.tx_hash == tx_hash)
            .map(|tx| tx.call.nonce);
        if let Some(tx_nonce) = tx_nonce {
            let mut nonce = self.nonce.lock().unwrap();
            *nonce = (*nonce).max(tx_nonce + 1);
        }
        Ok(Some(FinalizeReceipt {
            tx_hash,
            status: behavior == ReceiptBehavior::Success,
            block_number: Some(self.height.load(Ordering::SeqCst) + 1),
            transaction_index: 0,
            gas_used: Some(U256::from(50_000)),
            cumulative_gas_used: U256::from(50_000),
        }))
    }
}

/// Event source over an in-memory table.
#[derive(Clone, Debug, Default)]
pub struct MockEventSource {
    rows: Arc<Mutex<Vec<SessionRecord>>>,
    lowest_unresolved: Arc<Mutex<Option<Option<u64>>>>,
    failures: Arc<AtomicU32>,
    fail_after: Arc<Mutex<Option<u32>>>,
    queries: Arc<Mutex<Vec<SessionQuery>>>,
}

impl MockEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_row(&self, row: SessionRecord) {
        self.rows.lock().unwrap().push(row);
    }

    /// Simulate the indexer observing the finalization of `key`.
    pub fn set_finalization_hash(&self, key: &SessionKey, hash: &str) {
        for row in self.rows.lock().unwrap().iter_mut() {
            if row.key() == *key {
                row.finalization_hash = Some(hash.to_string());
            }
        }
    }

    /// Overrides the value derived from the rows.
    pub fn set_lowest_unresolved(&self, position: Option<u64>) {
        *self.lowest_unresolved.lock().unwrap() = Some(position);
    }

    pub fn fail_next_queries(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Let `successes` more fetches through, then fail the one after.
    pub fn fail_fetch_after(&self, successes: u32) {
        *self.fail_after.lock().unwrap() = Some(successes);
    }

    /// `(from_position, unresolved_only)` of every successful fetch.
    pub fn queries(&self) -> Vec<(u64, bool)> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|q| (q.from_position, q.unresolved_only))
            .collect()
    }

    /// Every successful fetch, paging included.
    pub fn page_queries(&self) -> Vec<SessionQuery> {
        self.queries.lock().unwrap().clone()
    }

    fn take_failure(&self) -> anyhow::Result<()> {
        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures.store(failures - 1, Ordering::SeqCst);
            anyhow::bail!("mock event source failure");
        }
        Ok(())
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn fetch_sessions(&self, query: SessionQuery) -> anyhow::Result<Vec<SessionRecord>> {
        self.take_failure()?;
        {
            let mut fail_after = self.fail_after.lock().unwrap();
            match *fail_after {
                Some(0) => {
                    *fail_after = None;
                    anyhow::bail!("mock event source failure");
                }
                Some(n) => *fail_after = Some(n - 1),
                None => {}
            }
        }
        self.queries.lock().unwrap().push(query);
        let mut rows: Vec<SessionRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.position >= query.from_position)
            .filter(|r| query.after.map_or(true, |after| r.row_id() > after))
            .filter(|r| !query.unresolved_only || r.finalization_hash.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(SessionRecord::row_id);
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn lowest_unresolved_position(&self) -> anyhow::Result<Option<u64>> {
        self.take_failure()?;
        if let Some(position) = *self.lowest_unresolved.lock().unwrap() {
            return Ok(position);
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.finalization_hash.is_none())
            .map(|r| r.position)
            .min())
    }
}
