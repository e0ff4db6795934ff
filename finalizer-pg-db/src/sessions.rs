// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read access to the proof-session view.
//!
//! The view is produced by an external indexer from contract events on the observer chain. One
//! row per session start, keyed by the observer-chain position (`block_id`) at which the session
//! was opened. `finalization_hash` stays NULL until the indexer observes the finalization
//! transaction.

use anyhow::{anyhow, Context, Result};
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;
use tracing::debug;

use crate::Db;

/// One session record as exposed by the view.
#[derive(QueryableByName, Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    #[diesel(sql_type = BigInt)]
    pub block_id: i64,
    #[diesel(sql_type = BigInt)]
    pub chain_id: i64,
    #[diesel(sql_type = BigInt)]
    pub block_height: i64,
    #[diesel(sql_type = BigInt)]
    pub deadline: i64,
    #[diesel(sql_type = Nullable<Text>)]
    pub finalization_hash: Option<String>,
}

#[derive(QueryableByName, Debug)]
struct LowestPosition {
    #[diesel(sql_type = Nullable<BigInt>)]
    position: Option<i64>,
}

/// Queries over a single session table or view.
#[derive(Clone)]
pub struct SessionView {
    db: Db,
    table: String,
}

impl SessionView {
    /// The table name is interpolated into SQL, so it is restricted to plain (optionally
    /// schema-qualified) identifiers.
    pub fn new(db: Db, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { db, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Up to `limit` rows with `block_id >= from_block_id`, ordered by
    /// `(block_id, chain_id, block_height)`. When `after` is set only rows strictly after that
    /// triple are returned, which pages through the view without skipping or repeating rows. With
    /// `unresolved_only` set, rows whose finalization hash is already known are filtered out.
    pub async fn sessions_from(
        &self,
        from_block_id: i64,
        after: Option<(i64, i64, i64)>,
        unresolved_only: bool,
        limit: i64,
    ) -> Result<Vec<SessionRow>> {
        let filter = if unresolved_only {
            " AND finalization_hash IS NULL"
        } else {
            ""
        };
        let sql = format!(
            "SELECT block_id::BIGINT AS block_id, chain_id::BIGINT AS chain_id, \
             block_height::BIGINT AS block_height, deadline::BIGINT AS deadline, \
             finalization_hash::TEXT AS finalization_hash \
             FROM {} WHERE block_id >= $1 \
             AND ($2::BIGINT IS NULL OR (block_id, chain_id, block_height) > ($2, $3, $4)){} \
             ORDER BY block_id, chain_id, block_height LIMIT $5",
            self.table, filter
        );

        let mut conn = self.db.connect().await?;
        let rows: Vec<SessionRow> = diesel::sql_query(sql)
            .bind::<BigInt, _>(from_block_id)
            .bind::<Nullable<BigInt>, _>(after.map(|a| a.0))
            .bind::<Nullable<BigInt>, _>(after.map(|a| a.1))
            .bind::<Nullable<BigInt>, _>(after.map(|a| a.2))
            .bind::<BigInt, _>(limit)
            .load(&mut conn)
            .await
            .with_context(|| format!("Failed to query sessions from {}", self.table))?;

        debug!(
            "[SessionView] {} rows from {} (block_id >= {}, after {:?}, unresolved_only={})",
            rows.len(),
            self.table,
            from_block_id,
            after,
            unresolved_only
        );
        Ok(rows)
    }

    /// Lowest `block_id` among rows whose finalization hash is still unknown.
    pub async fn lowest_unresolved_block_id(&self) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MIN(block_id)::BIGINT AS position FROM {} WHERE finalization_hash IS NULL",
            self.table
        );
        let mut conn = self.db.connect().await?;
        let row: LowestPosition = diesel::sql_query(sql)
            .get_result(&mut conn)
            .await
            .with_context(|| format!("Failed to query lowest unresolved session in {}", self.table))?;
        Ok(row.position)
    }
}

pub fn validate_table_name(table: &str) -> Result<()> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && !part.starts_with(|c: char| c.is_ascii_digit())
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(anyhow!("Invalid session table name: {:?}", table));
    }
    Ok(())
}
