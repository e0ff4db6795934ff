// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Request registry
//!
//! In-memory bookkeeping of outstanding finalization obligations, partitioned by origin chain.
//! This is a plain data structure: callers serialize access through
//! [`crate::state::SharedCoordinatorState`].
//!
//! ```text
//!   mark_pending_finalization         mark_pending_confirmation         clear_confirmed
//! ─────────────────────────────▶ PF ─────────────────────────────▶ PC ─────────────────▶ (gone)
//!                                                                  │ ▲
//!                                                                  └─┘ refresh_finalized_at
//! ```

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::types::{FinalizationRequest, RequestState, SessionKey};

type ChainPartition = BTreeMap<u64, BTreeMap<u64, FinalizationRequest>>;

#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending_finalization: ChainPartition,
    pending_confirmation: ChainPartition,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request. Returns false if the key is already tracked in either state.
    pub fn mark_pending_finalization(&mut self, request: FinalizationRequest) -> bool {
        if self.state_of(&request.key).is_some() {
            return false;
        }
        self.pending_finalization
            .entry(request.key.origin_chain_id)
            .or_default()
            .insert(request.key.origin_block_height, request);
        true
    }

    /// Move a request from pending-finalization to pending-confirmation, stamping the dispatch
    /// time. Returns false if the key was not pending finalization.
    pub fn mark_pending_confirmation(&mut self, key: &SessionKey, now: Instant) -> bool {
        let Some(mut request) = take(&mut self.pending_finalization, key) else {
            return false;
        };
        request.finalized_at = Some(now);
        self.pending_confirmation
            .entry(key.origin_chain_id)
            .or_default()
            .insert(key.origin_block_height, request);
        true
    }

    /// Re-stamp a request that is already pending confirmation (refinalization).
    pub fn refresh_finalized_at(&mut self, key: &SessionKey, now: Instant) -> bool {
        match self
            .pending_confirmation
            .get_mut(&key.origin_chain_id)
            .and_then(|chain| chain.get_mut(&key.origin_block_height))
        {
            Some(request) => {
                request.finalized_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Drop a request whose finalization has been observed. Returns the removed request.
    pub fn clear_confirmed(&mut self, key: &SessionKey) -> Option<FinalizationRequest> {
        take(&mut self.pending_confirmation, key)
    }

    pub fn list_pending_finalization(&self) -> Vec<FinalizationRequest> {
        flatten(&self.pending_finalization)
    }

    pub fn list_pending_confirmation(&self) -> Vec<FinalizationRequest> {
        flatten(&self.pending_confirmation)
    }

    pub fn state_of(&self, key: &SessionKey) -> Option<RequestState> {
        if contains(&self.pending_finalization, key) {
            Some(RequestState::PendingFinalization)
        } else if contains(&self.pending_confirmation, key) {
            Some(RequestState::PendingConfirmation)
        } else {
            None
        }
    }

    /// Smallest session start position across both pending sets and all chains.
    pub fn lowest_session_start(&self) -> Option<u64> {
        self.pending_finalization
            .values()
            .chain(self.pending_confirmation.values())
            .flat_map(|chain| chain.values())
            .map(|r| r.session_start_position)
            .min()
    }

    pub fn pending_finalization_count(&self) -> usize {
        self.pending_finalization.values().map(|c| c.len()).sum()
    }

    pub fn pending_confirmation_count(&self) -> usize {
        self.pending_confirmation.values().map(|c| c.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.pending_finalization_count() + self.pending_confirmation_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn contains(partition: &ChainPartition, key: &SessionKey) -> bool {
    partition
        .get(&key.origin_chain_id)
        .is_some_and(|chain| chain.contains_key(&key.origin_block_height))
}

fn take(partition: &mut ChainPartition, key: &SessionKey) -> Option<FinalizationRequest> {
    let chain = partition.get_mut(&key.origin_chain_id)?;
    let request = chain.remove(&key.origin_block_height);
    if chain.is_empty() {
        partition.remove(&key.origin_chain_id);
    }
    request
}

fn flatten(partition: &ChainPartition) -> Vec<FinalizationRequest> {
    partition
        .values()
        .flat_map(|chain| chain.values().cloned())
        .collect()
}
