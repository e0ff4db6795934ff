// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use proof_finalizer_pg_db::{SessionRow, SessionView};

use crate::types::{RowId, SessionRecord};

/// One page of an event-source read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionQuery {
    pub from_position: u64,
    /// Last row of the previous page
    pub after: Option<RowId>,
    /// Skip rows with a known finalization hash
    pub unresolved_only: bool,
    pub limit: usize,
}

impl SessionQuery {
    pub fn first_page(from_position: u64, unresolved_only: bool, limit: usize) -> Self {
        Self {
            from_position,
            after: None,
            unresolved_only,
            limit,
        }
    }

    pub fn next_page(self, after: RowId) -> Self {
        Self {
            after: Some(after),
            ..self
        }
    }
}

/// Append-mostly view of session starts and, once observed, their finalization hashes.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Up to `query.limit` rows at or after `query.from_position` and strictly after
    /// `query.after`, in [`RowId`] order.
    async fn fetch_sessions(&self, query: SessionQuery) -> Result<Vec<SessionRecord>>;

    /// Lowest position among sessions whose finalization hash is still unknown.
    async fn lowest_unresolved_position(&self) -> Result<Option<u64>>;
}

/// [`EventSource`] backed by the indexer's Postgres view.
#[derive(Clone)]
pub struct PgEventSource {
    view: SessionView,
}

impl PgEventSource {
    pub fn new(view: SessionView) -> Self {
        Self { view }
    }
}

#[async_trait]
impl EventSource for PgEventSource {
    async fn fetch_sessions(&self, query: SessionQuery) -> Result<Vec<SessionRecord>> {
        let after = query
            .after
            .map(|row| {
                Ok::<_, anyhow::Error>((
                    to_column("block_id", row.position)?,
                    to_column("chain_id", row.key.origin_chain_id)?,
                    to_column("block_height", row.key.origin_block_height)?,
                ))
            })
            .transpose()?;
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        self.view
            .sessions_from(
                to_column("block_id", query.from_position)?,
                after,
                query.unresolved_only,
                limit,
            )
            .await?
            .into_iter()
            .map(session_record_from_row)
            .collect()
    }

    async fn lowest_unresolved_position(&self) -> Result<Option<u64>> {
        self.view
            .lowest_unresolved_block_id()
            .await?
            .map(|p| non_negative("block_id", p))
            .transpose()
    }
}

pub(crate) fn session_record_from_row(row: SessionRow) -> Result<SessionRecord> {
    Ok(SessionRecord {
        position: non_negative("block_id", row.block_id)?,
        origin_chain_id: non_negative("chain_id", row.chain_id)?,
        origin_block_height: non_negative("block_height", row.block_height)?,
        deadline: non_negative("deadline", row.deadline)?,
        finalization_hash: row.finalization_hash.filter(|h| !h.trim().is_empty()),
    })
}

fn to_column(column: &str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} {} out of range", column, value))
}

fn non_negative(column: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("Negative {} in session row: {}", column, value))
}
