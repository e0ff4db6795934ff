// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ingestion feed
//!
//! Periodically reads the event source from the cursor and feeds each row into the shared
//! state. The first successful pass only reads unresolved sessions (catch-up); later passes read
//! every row so that confirmations of dispatched requests are observed. Each pass pages through
//! the source so a large backlog is never held in memory at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cursor::CursorFile;
use crate::source::{EventSource, SessionQuery};
use crate::state::{IngestOutcome, SharedCoordinatorState};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionMode {
    CatchUp,
    Incremental,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionPassSummary {
    pub pages: usize,
    pub rows: usize,
    pub queued: usize,
    pub confirmed: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub cursor_advanced: Option<u64>,
}

pub struct IngestionFeed<S> {
    source: Arc<S>,
    state: SharedCoordinatorState,
    cursor_file: Option<CursorFile>,
    poll_interval: Duration,
    page_size: usize,
    mode: IngestionMode,
}

impl<S: EventSource> IngestionFeed<S> {
    pub fn new(
        source: Arc<S>,
        state: SharedCoordinatorState,
        cursor_file: Option<CursorFile>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            state,
            cursor_file,
            poll_interval,
            page_size: DEFAULT_PAGE_SIZE,
            mode: IngestionMode::CatchUp,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn mode(&self) -> IngestionMode {
        self.mode
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("[Ingestion] Starting from cursor {}", self.state.cursor().await);
        while !cancel.is_cancelled() {
            if let Err(e) = self.run_pass().await {
                error!("[Ingestion] Pass abandoned: {:#}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("[Ingestion] Stopped");
    }

    /// Read the source once from the current cursor, page by page. On error the pages already
    /// read stay applied (ingesting a row twice is a no-op) and the mode is unchanged.
    pub async fn run_pass(&mut self) -> anyhow::Result<IngestionPassSummary> {
        let from = self.state.cursor().await;
        let mut query = SessionQuery::first_page(
            from,
            self.mode == IngestionMode::CatchUp,
            self.page_size,
        );
        let mut summary = IngestionPassSummary::default();
        loop {
            let rows = self
                .source
                .fetch_sessions(query)
                .await
                .with_context(|| format!("Failed to read sessions from position {}", from))?;
            summary.pages += 1;
            summary.rows += rows.len();

            let mut cursor_advanced = None;
            for row in &rows {
                match self.state.ingest(row).await {
                    IngestOutcome::Queued => summary.queued += 1,
                    IngestOutcome::Confirmed {
                        cursor_advanced: advanced,
                    } => {
                        summary.confirmed += 1;
                        if advanced.is_some() {
                            cursor_advanced = advanced;
                        }
                    }
                    IngestOutcome::Duplicate => summary.duplicates += 1,
                    IngestOutcome::Ignored => summary.ignored += 1,
                }
            }
            if let Some(position) = cursor_advanced {
                summary.cursor_advanced = Some(position);
                self.persist_cursor(position).await;
            }

            match rows.last() {
                Some(last) if rows.len() >= self.page_size => query = query.next_page(last.row_id()),
                _ => break,
            }
        }

        info!(
            "[Ingestion] {:?} pass from {}: {} rows in {} pages, {} queued, {} confirmed, {} duplicates, {} ignored",
            self.mode,
            from,
            summary.rows,
            summary.pages,
            summary.queued,
            summary.confirmed,
            summary.duplicates,
            summary.ignored
        );
        if self.mode == IngestionMode::CatchUp {
            info!("[Ingestion] Catch-up done, switching to incremental mode");
            self.mode = IngestionMode::Incremental;
        }
        Ok(summary)
    }

    async fn persist_cursor(&self, position: u64) {
        if let Some(file) = &self.cursor_file {
            if let Err(e) = file.store(position).await {
                warn!("[Ingestion] Failed to persist cursor {}: {:#}", position, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockEventSource;
    use crate::types::{RequestState, SessionKey, SessionRecord};
    use tokio::time::Instant;

    fn record(position: u64, height: u64, hash: Option<&str>) -> SessionRecord {
        SessionRecord {
            position,
            origin_chain_id: 1,
            origin_block_height: height,
            deadline: 10,
            finalization_hash: hash.map(str::to_string),
        }
    }

    fn feed(
        source: &MockEventSource,
        state: &SharedCoordinatorState,
        cursor_file: Option<CursorFile>,
    ) -> IngestionFeed<MockEventSource> {
        IngestionFeed::new(
            Arc::new(source.clone()),
            state.clone(),
            cursor_file,
            Duration::from_secs(40),
        )
    }

    #[tokio::test]
    async fn test_catch_up_then_incremental() {
        let source = MockEventSource::new();
        source.push_row(record(2, 100, Some("0xdone")));
        source.push_row(record(3, 101, None));
        let state = SharedCoordinatorState::new(1);
        let mut feed = feed(&source, &state, None);

        assert_eq!(feed.mode(), IngestionMode::CatchUp);
        let summary = feed.run_pass().await.unwrap();
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.queued, 1);
        assert_eq!(feed.mode(), IngestionMode::Incremental);

        let summary = feed.run_pass().await.unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.ignored, 1);
        assert_eq!(source.queries(), vec![(1, true), (1, false)]);
    }

    #[tokio::test]
    async fn test_source_failure_leaves_state_untouched() {
        let source = MockEventSource::new();
        source.push_row(record(3, 101, None));
        let state = SharedCoordinatorState::new(1);
        let mut feed = feed(&source, &state, None);

        source.fail_next_queries(1);
        assert!(feed.run_pass().await.is_err());
        assert_eq!(feed.mode(), IngestionMode::CatchUp);
        assert_eq!(state.cursor().await, 1);
        assert_eq!(state.counts().await.pending_finalization, 0);

        // Retried as catch-up from the same cursor
        feed.run_pass().await.unwrap();
        assert_eq!(source.queries(), vec![(1, true)]);
        assert_eq!(state.counts().await.pending_finalization, 1);
    }

    #[tokio::test]
    async fn test_confirmation_advances_and_persists_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let cursor_file = CursorFile::new(dir.path().join("last_block_id"));
        let source = MockEventSource::new();
        source.push_row(record(5, 100, None));
        source.push_row(record(9, 101, None));
        let state = SharedCoordinatorState::new(1);
        let mut feed = feed(&source, &state, Some(cursor_file.clone()));
        feed.run_pass().await.unwrap();

        let first = SessionKey::new(1, 100);
        let second = SessionKey::new(1, 101);
        state.mark_dispatched(&first, Instant::now()).await;
        state.mark_dispatched(&second, Instant::now()).await;

        // The later session is confirmed first; the earlier one holds the cursor back
        source.set_finalization_hash(&second, "0x2");
        let summary = feed.run_pass().await.unwrap();
        assert_eq!(summary.confirmed, 1);
        assert_eq!(summary.cursor_advanced, None);
        assert_eq!(state.cursor().await, 1);
        assert_eq!(cursor_file.load().await.unwrap(), None);

        source.set_finalization_hash(&first, "0x1");
        let summary = feed.run_pass().await.unwrap();
        assert_eq!(summary.confirmed, 1);
        assert_eq!(summary.cursor_advanced, Some(5));
        assert_eq!(state.cursor().await, 5);
        assert_eq!(cursor_file.load().await.unwrap(), Some(5));
        assert_eq!(state.state_of(&first).await, None);
    }

    #[tokio::test]
    async fn test_repeated_passes_are_idempotent() {
        let source = MockEventSource::new();
        source.push_row(record(2, 100, None));
        source.push_row(record(3, 101, None));
        let state = SharedCoordinatorState::new(1);
        let mut feed = feed(&source, &state, None);

        feed.run_pass().await.unwrap();
        let counts = state.counts().await;
        for _ in 0..3 {
            let summary = feed.run_pass().await.unwrap();
            assert_eq!(summary.queued, 0);
            assert_eq!(summary.duplicates, 2);
        }
        assert_eq!(state.counts().await, counts);
        assert_eq!(
            state.state_of(&SessionKey::new(1, 100)).await,
            Some(RequestState::PendingFinalization)
        );
    }

    #[tokio::test]
    async fn test_pass_pages_through_backlog() {
        let source = MockEventSource::new();
        // Three sessions opened at the same position straddle a page boundary
        for (chain, height) in [(2, 100), (1, 100), (1, 101)] {
            source.push_row(SessionRecord {
                origin_chain_id: chain,
                ..record(5, height, None)
            });
        }
        source.push_row(record(6, 102, None));
        source.push_row(record(7, 103, Some("0xdone")));
        let state = SharedCoordinatorState::new(1);
        let mut feed = feed(&source, &state, None).with_page_size(2);

        // The last page is full, so one more (empty) read ends the pass
        let summary = feed.run_pass().await.unwrap();
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.queued, 4);
        assert_eq!(state.counts().await.pending_finalization, 4);

        let pages = source.page_queries();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].after, None);
        assert_eq!(pages[0].limit, 2);
        assert_eq!(
            pages[1].after.map(|row| (row.position, row.key)),
            Some((5, SessionKey::new(1, 101)))
        );

        // Incremental passes page over resolved rows too
        let summary = feed.run_pass().await.unwrap();
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.duplicates, 4);
        assert_eq!(summary.ignored, 1);
    }

    #[tokio::test]
    async fn test_failure_on_later_page_keeps_earlier_pages() {
        let source = MockEventSource::new();
        for position in 2..6 {
            source.push_row(record(position, 100 + position, None));
        }
        let state = SharedCoordinatorState::new(1);
        let mut feed = feed(&source, &state, None).with_page_size(2);

        // Only the first page gets through
        source.fail_fetch_after(1);
        assert!(feed.run_pass().await.is_err());
        assert_eq!(feed.mode(), IngestionMode::CatchUp);
        assert_eq!(state.counts().await.pending_finalization, 2);

        let summary = feed.run_pass().await.unwrap();
        assert_eq!(summary.duplicates, 2);
        assert_eq!(summary.queued, 2);
        assert_eq!(feed.mode(), IngestionMode::Incremental);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_cancelled() {
        let source = MockEventSource::new();
        let state = SharedCoordinatorState::new(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(feed(&source, &state, None).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(85)).await;
        assert_eq!(source.queries(), vec![(1, true), (1, false), (1, false)]);
        cancel.cancel();
        handle.await.unwrap();
    }
}
