// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Finalization scheduler
//!
//! Waits for the observer chain to produce a new block, then:
//! 1. re-sends finalize calls that were dispatched too long ago without being observed
//! 2. sends finalize calls for every pending request whose deadline is below the new height
//!
//! A request whose submission fails stays where it is and is picked up again on the next pass.
//! Shutdown is only observed between requests: a finalize call that is already on the wire is
//! awaited and recorded before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::chain::ChainClient;
use crate::error::FinalizerError;
use crate::state::SharedCoordinatorState;
use crate::submitter::{FinalizeOutcome, TransactionSubmitter};
use crate::types::FinalizationRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub height_poll_interval: Duration,
    /// Dispatched requests not confirmed within this window are sent again
    pub confirmation_timeout: Duration,
    pub refinalize_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            height_poll_interval: Duration::from_secs(12),
            confirmation_timeout: Duration::from_secs(600),
            refinalize_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerPassSummary {
    pub finalized: usize,
    pub refinalized: usize,
    pub failed: usize,
}

pub struct FinalizationScheduler<C> {
    state: SharedCoordinatorState,
    submitter: Arc<TransactionSubmitter<C>>,
    config: SchedulerConfig,
    last_height: Option<u64>,
}

impl<C: ChainClient> FinalizationScheduler<C> {
    pub fn new(
        state: SharedCoordinatorState,
        submitter: Arc<TransactionSubmitter<C>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state,
            submitter,
            config,
            last_height: None,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "[Scheduler] Starting {} finalization scheduler",
            self.submitter.kind()
        );
        while let Some(height) = self.wait_for_new_height(&cancel).await {
            self.run_pass_until(height, &cancel).await;
        }
        info!("[Scheduler] Stopped");
    }

    /// Poll until the chain height moves past the last height this loop acted on. Returns `None`
    /// once `cancel` fires; a height query already under way is allowed to finish.
    pub async fn wait_for_new_height(&mut self, cancel: &CancellationToken) -> Option<u64> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.submitter.block_number().await {
                Ok(height) if self.last_height.map_or(true, |last| height > last) => {
                    self.last_height = Some(height);
                    return Some(height);
                }
                Ok(height) => debug!("[Scheduler] Height still at {}", height),
                Err(e) => error!("[Scheduler] Failed to read block number: {:#}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.height_poll_interval) => {}
            }
        }
    }

    /// One refinalize sweep followed by one finalization sweep at `height`.
    pub async fn run_pass(&self, height: u64) -> SchedulerPassSummary {
        self.run_pass_until(height, &CancellationToken::new()).await
    }

    /// Like [`Self::run_pass`], but stops before the next request once `cancel` fires.
    pub async fn run_pass_until(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> SchedulerPassSummary {
        let mut summary = SchedulerPassSummary::default();

        let stale = self
            .state
            .stale_confirmations(Instant::now(), self.config.confirmation_timeout)
            .await;
        if !stale.is_empty() {
            info!("[Scheduler] Refinalizing {} sessions", stale.len());
            for batch in stale.chunks(self.config.refinalize_batch_size.max(1)) {
                let mut done = 0;
                for request in batch {
                    if cancel.is_cancelled() {
                        info!("[Scheduler] Shutdown requested, pass interrupted");
                        return summary;
                    }
                    if self.finalize(request).await {
                        done += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                summary.refinalized += done;
                info!("[Scheduler] {} sessions have been refinalized", done);
            }
        }

        let due = self.state.due_for_finalization(height).await;
        if !due.is_empty() {
            info!(
                "[Scheduler] Finalizing {} sessions at height {}",
                due.len(),
                height
            );
            for request in &due {
                if cancel.is_cancelled() {
                    info!("[Scheduler] Shutdown requested, pass interrupted");
                    return summary;
                }
                if self.finalize(request).await {
                    summary.finalized += 1;
                } else {
                    summary.failed += 1;
                }
            }
            info!(
                "[Scheduler] {} sessions have been finalized",
                summary.finalized
            );
        }
        summary
    }

    async fn finalize(&self, request: &FinalizationRequest) -> bool {
        match self.submitter.submit(request.key).await {
            Ok(outcome) => {
                match &outcome {
                    FinalizeOutcome::Mined(receipt) => {
                        debug!("[Scheduler] {} mined in {:?}", request.key, receipt.block_number)
                    }
                    FinalizeOutcome::Reverted(_) => {
                        debug!("[Scheduler] {} reverted, awaiting confirmation", request.key)
                    }
                    FinalizeOutcome::AlreadyResolved => {
                        debug!("[Scheduler] {} already resolved", request.key)
                    }
                }
                self.state.mark_dispatched(&request.key, Instant::now()).await;
                true
            }
            Err(e) => {
                let error_type = e
                    .downcast_ref::<FinalizerError>()
                    .map(|e| e.error_type())
                    .unwrap_or("unknown");
                error!(
                    error_type,
                    "[Scheduler] Failed to finalize {} (deadline {}): {:#}",
                    request.key,
                    request.deadline,
                    e
                );
                false
            }
        }
    }
}
