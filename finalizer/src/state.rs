// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Registry and cursor behind a single lock.
//!
//! Both loops go through the methods here. Each method takes the lock once, so a membership check,
//! the mutation it guards, and any resulting cursor advance are observed atomically. The lock is
//! never held across chain or database I/O.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cursor::CursorTracker;
use crate::registry::RequestRegistry;
use crate::types::{FinalizationRequest, RequestState, SessionKey, SessionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New request, now pending finalization
    Queued,
    /// A dispatched request was observed on chain and dropped
    Confirmed { cursor_advanced: Option<u64> },
    /// Already tracked and still unresolved
    Duplicate,
    /// Resolved before it was ever tracked here, or hash seen before dispatch
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub pending_finalization: usize,
    pub pending_confirmation: usize,
}

#[derive(Debug)]
struct Inner {
    registry: RequestRegistry,
    cursor: CursorTracker,
}

#[derive(Debug, Clone)]
pub struct SharedCoordinatorState {
    inner: Arc<Mutex<Inner>>,
}

impl SharedCoordinatorState {
    pub fn new(start_position: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                registry: RequestRegistry::new(),
                cursor: CursorTracker::new(start_position),
            })),
        }
    }

    /// Apply one event-source row.
    pub async fn ingest(&self, record: &SessionRecord) -> IngestOutcome {
        let key = record.key();
        let mut inner = self.inner.lock().await;
        let state = inner.registry.state_of(&key);
        match (&record.finalization_hash, state) {
            (None, None) => {
                inner.registry.mark_pending_finalization(record.to_request());
                IngestOutcome::Queued
            }
            (None, Some(_)) => IngestOutcome::Duplicate,
            (Some(_), Some(RequestState::PendingConfirmation)) => {
                inner.registry.clear_confirmed(&key);
                let Inner { registry, cursor } = &mut *inner;
                let cursor_advanced = cursor.propose_advance(record.position, registry);
                IngestOutcome::Confirmed { cursor_advanced }
            }
            (Some(_), _) => IngestOutcome::Ignored,
        }
    }

    /// Pending-finalization requests whose deadline is below `height`.
    pub async fn due_for_finalization(&self, height: u64) -> Vec<FinalizationRequest> {
        let inner = self.inner.lock().await;
        inner
            .registry
            .list_pending_finalization()
            .into_iter()
            .filter(|r| r.is_due(height))
            .collect()
    }

    /// Pending-confirmation requests dispatched more than `timeout` before `now`.
    pub async fn stale_confirmations(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<FinalizationRequest> {
        let inner = self.inner.lock().await;
        inner
            .registry
            .list_pending_confirmation()
            .into_iter()
            .filter(|r| match r.finalized_at {
                Some(at) => now.saturating_duration_since(at) > timeout,
                None => true,
            })
            .collect()
    }

    /// Record a successful dispatch. A pending request moves to pending-confirmation, one already
    /// there gets a fresh timestamp. Returns false if the key is no longer tracked.
    pub async fn mark_dispatched(&self, key: &SessionKey, now: Instant) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.registry.state_of(key) {
            Some(RequestState::PendingFinalization) => {
                inner.registry.mark_pending_confirmation(key, now)
            }
            Some(RequestState::PendingConfirmation) => {
                inner.registry.refresh_finalized_at(key, now)
            }
            None => false,
        }
    }

    pub async fn cursor(&self) -> u64 {
        self.inner.lock().await.cursor.current()
    }

    pub async fn state_of(&self, key: &SessionKey) -> Option<RequestState> {
        self.inner.lock().await.registry.state_of(key)
    }

    pub async fn counts(&self) -> RegistryCounts {
        let inner = self.inner.lock().await;
        RegistryCounts {
            pending_finalization: inner.registry.pending_finalization_count(),
            pending_confirmation: inner.registry.pending_confirmation_count(),
        }
    }
}
