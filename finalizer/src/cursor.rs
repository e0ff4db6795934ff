// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cursor over observer-chain positions
//!
//! The cursor is the position from which the ingestion feed re-reads the event source. It may
//! only move past a position once no tracked request started below it, so that a restart never
//! skips an unresolved session.
//!
//! ## Start position
//! On startup the first available of:
//! 1. an explicit override from configuration
//! 2. the persisted cursor file
//! 3. `lowest unresolved position - 1` from the event source
//! 4. the caller-supplied default

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::registry::RequestRegistry;
use crate::source::EventSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorTracker {
    position: u64,
}

impl CursorTracker {
    pub fn new(position: u64) -> Self {
        Self { position }
    }

    pub fn current(&self) -> u64 {
        self.position
    }

    /// Advance to `candidate` if it is ahead of the cursor and no tracked request started before
    /// it. Returns the new position when the cursor moved.
    pub fn propose_advance(&mut self, candidate: u64, registry: &RequestRegistry) -> Option<u64> {
        if candidate <= self.position {
            return None;
        }
        if let Some(lowest) = registry.lowest_session_start() {
            if lowest < candidate {
                return None;
            }
        }
        self.position = candidate;
        Some(candidate)
    }
}

/// Plain-text file holding the last advanced cursor position.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the file does not exist yet.
    pub async fn load(&self) -> Result<Option<u64>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let position = content.trim().parse::<u64>().with_context(|| {
                    format!("Corrupt cursor file {}: {:?}", self.path.display(), content)
                })?;
                Ok(Some(position))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to read cursor file {}", self.path.display())
            }),
        }
    }

    /// Written to a sibling temp file and renamed so a crash never leaves a truncated cursor.
    pub async fn store(&self, position: u64) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, position.to_string())
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Determine where ingestion starts reading.
pub async fn resolve_start_position<S: EventSource>(
    override_position: Option<u64>,
    cursor_file: Option<&CursorFile>,
    source: &S,
    default_position: u64,
) -> u64 {
    if let Some(position) = override_position {
        info!("[Cursor] Starting from configured position {}", position);
        return position;
    }

    if let Some(file) = cursor_file {
        match file.load().await {
            Ok(Some(position)) => {
                info!(
                    "[Cursor] Starting from persisted position {} ({})",
                    position,
                    file.path().display()
                );
                return position;
            }
            Ok(None) => {}
            Err(e) => warn!("[Cursor] Ignoring cursor file: {:#}", e),
        }
    }

    match source.lowest_unresolved_position().await {
        Ok(Some(lowest)) => {
            let position = lowest.saturating_sub(1);
            info!(
                "[Cursor] Lowest unresolved session at {}, starting from {}",
                lowest, position
            );
            position
        }
        Ok(None) => {
            info!(
                "[Cursor] No unresolved sessions, starting from default {}",
                default_position
            );
            default_position
        }
        Err(e) => {
            warn!(
                "[Cursor] Failed to query lowest unresolved session, starting from default {}: {:#}",
                default_position, e
            );
            default_position
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockEventSource;
    use crate::types::{FinalizationRequest, SessionKey};
    use tokio::time::Instant;

    fn request(chain: u64, height: u64, start: u64) -> FinalizationRequest {
        FinalizationRequest::new(SessionKey::new(chain, height), 100, start)
    }

    #[test]
    fn test_cursor_blocked_by_pending_requests() {
        let mut registry = RequestRegistry::new();
        let mut cursor = CursorTracker::new(10);

        registry.mark_pending_finalization(request(1, 1, 30));
        registry.mark_pending_finalization(request(2, 1, 40));
        registry.mark_pending_confirmation(&SessionKey::new(2, 1), Instant::now());

        // Both pending sets count, on any chain
        assert_eq!(cursor.propose_advance(50, &registry), None);
        assert_eq!(cursor.propose_advance(31, &registry), None);
        assert_eq!(cursor.current(), 10);

        // Equal to the lowest start is allowed: that session is not below the cursor
        assert_eq!(cursor.propose_advance(30, &registry), Some(30));

        registry.clear_confirmed(&SessionKey::new(2, 1));
        assert_eq!(cursor.propose_advance(50, &registry), None);
        registry.mark_pending_confirmation(&SessionKey::new(1, 1), Instant::now());
        registry.clear_confirmed(&SessionKey::new(1, 1));

        // Retrying the same candidate succeeds once nothing blocks it
        assert_eq!(cursor.propose_advance(50, &registry), Some(50));
        assert_eq!(cursor.current(), 50);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let registry = RequestRegistry::new();
        let mut cursor = CursorTracker::new(100);
        assert_eq!(cursor.propose_advance(99, &registry), None);
        assert_eq!(cursor.propose_advance(100, &registry), None);
        assert_eq!(cursor.current(), 100);
        assert_eq!(cursor.propose_advance(101, &registry), Some(101));
    }

    #[tokio::test]
    async fn test_cursor_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = CursorFile::new(dir.path().join("last_block_id"));
        assert_eq!(file.load().await.unwrap(), None);
        file.store(1234).await.unwrap();
        assert_eq!(file.load().await.unwrap(), Some(1234));
        file.store(1300).await.unwrap();
        assert_eq!(file.load().await.unwrap(), Some(1300));
    }

    #[tokio::test]
    async fn test_cursor_file_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_block_id");
        tokio::fs::write(&path, "not-a-number").await.unwrap();
        assert!(CursorFile::new(path).load().await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_start_position_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let file = CursorFile::new(dir.path().join("last_block_id"));
        let source = MockEventSource::new();
        source.set_lowest_unresolved(Some(77));

        // Override wins over everything
        file.store(500).await.unwrap();
        assert_eq!(
            resolve_start_position(Some(9), Some(&file), &source, 1).await,
            9
        );
        // Then the persisted file
        assert_eq!(
            resolve_start_position(None, Some(&file), &source, 1).await,
            500
        );
        // Then the source, minus one
        assert_eq!(resolve_start_position(None, None, &source, 1).await, 76);
        // Then the default
        source.set_lowest_unresolved(None);
        assert_eq!(resolve_start_position(None, None, &source, 1).await, 1);
    }

    #[tokio::test]
    async fn test_resolve_start_position_source_failure_uses_default() {
        let source = MockEventSource::new();
        source.fail_next_queries(1);
        assert_eq!(resolve_start_position(None, None, &source, 5).await, 5);
    }
}
