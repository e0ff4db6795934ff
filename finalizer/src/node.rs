// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chain::ChainClient;
use crate::config::{LoadedFinalizerConfig, DEFAULT_START_POSITION};
use crate::cursor::{resolve_start_position, CursorFile};
use crate::ingestion::{IngestionFeed, DEFAULT_PAGE_SIZE};
use crate::scheduler::{FinalizationScheduler, SchedulerConfig};
use crate::source::EventSource;
use crate::state::SharedCoordinatorState;
use crate::submitter::{SubmitterConfig, TransactionSubmitter};

/// Everything the two loops need besides their clients.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub start_override: Option<u64>,
    pub default_start: u64,
    pub cursor_file: Option<PathBuf>,
    pub ingestion_poll_interval: Duration,
    pub ingestion_page_size: usize,
    pub scheduler: SchedulerConfig,
    pub submitter: SubmitterConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            start_override: None,
            default_start: DEFAULT_START_POSITION,
            cursor_file: None,
            ingestion_poll_interval: Duration::from_secs(40),
            ingestion_page_size: DEFAULT_PAGE_SIZE,
            scheduler: SchedulerConfig::default(),
            submitter: SubmitterConfig::default(),
        }
    }
}

impl LoadedFinalizerConfig {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            start_override: self.start_override,
            default_start: DEFAULT_START_POSITION,
            cursor_file: self.cursor_file.clone(),
            ingestion_poll_interval: self.ingestion_poll_interval,
            ingestion_page_size: self.ingestion_page_size,
            scheduler: self.scheduler.clone(),
            submitter: self.submitter.clone(),
        }
    }
}

/// Resolve the start cursor and spawn the ingestion and scheduler loops. Both stop when `cancel`
/// fires.
pub async fn run_finalizer<S: EventSource, C: ChainClient>(
    config: CoordinatorConfig,
    source: Arc<S>,
    chain: Arc<C>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let cursor_file = config.cursor_file.map(CursorFile::new);
    let start = resolve_start_position(
        config.start_override,
        cursor_file.as_ref(),
        source.as_ref(),
        config.default_start,
    )
    .await;
    let state = SharedCoordinatorState::new(start);
    info!(
        "[Node] Starting {} finalizer at cursor {}",
        config.submitter.kind, start
    );

    let submitter = Arc::new(TransactionSubmitter::new(chain, config.submitter));
    let ingestion = IngestionFeed::new(
        source,
        state.clone(),
        cursor_file,
        config.ingestion_poll_interval,
    )
    .with_page_size(config.ingestion_page_size);
    let scheduler = FinalizationScheduler::new(state, submitter, config.scheduler);

    vec![
        tokio::spawn(ingestion.run(cancel.clone())),
        tokio::spawn(scheduler.run(cancel)),
    ]
}
