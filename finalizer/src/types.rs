// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Natural key of a proof session: the origin chain and the origin block being proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub origin_chain_id: u64,
    pub origin_block_height: u64,
}

impl SessionKey {
    pub fn new(origin_chain_id: u64, origin_block_height: u64) -> Self {
        Self {
            origin_chain_id,
            origin_block_height,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin_chain_id, self.origin_block_height)
    }
}

/// The two independent families of sessions the ProofChain contract runs. Each process instance
/// serves one kind with its own registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    #[default]
    Specimen,
    Result,
}

impl RequestKind {
    /// Contract entry point that finalizes (and rewards) a session of this kind.
    pub fn finalize_method(&self) -> &'static str {
        match self {
            RequestKind::Specimen => "finalizeAndRewardSpecimenSession",
            RequestKind::Result => "finalizeAndRewardResultSession",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Specimen => write!(f, "specimen"),
            RequestKind::Result => write!(f, "result"),
        }
    }
}

impl FromStr for RequestKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "specimen" => Ok(RequestKind::Specimen),
            "result" => Ok(RequestKind::Result),
            other => Err(anyhow::anyhow!(
                "unknown request kind {:?}, expected 'specimen' or 'result'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for the deadline to pass and a finalize call to be dispatched
    PendingFinalization,
    /// Finalize call dispatched, waiting for the indexer to report its hash
    PendingConfirmation,
}

/// An outstanding finalization obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationRequest {
    pub key: SessionKey,
    /// Observer-chain height after which the session may be finalized
    pub deadline: u64,
    /// Observer-chain position at which the session was opened
    pub session_start_position: u64,
    /// When the last finalize call was dispatched
    pub finalized_at: Option<Instant>,
}

impl FinalizationRequest {
    pub fn new(key: SessionKey, deadline: u64, session_start_position: u64) -> Self {
        Self {
            key,
            deadline,
            session_start_position,
            finalized_at: None,
        }
    }

    pub fn is_due(&self, observed_height: u64) -> bool {
        self.deadline < observed_height
    }
}

/// Position of a row in the event source. Rows are read in this order: observer-chain position
/// first, then session key, so sessions opened at the same position still have a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RowId {
    pub position: u64,
    pub key: SessionKey,
}

/// One row of the event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Observer-chain position of the session start
    pub position: u64,
    pub origin_chain_id: u64,
    pub origin_block_height: u64,
    pub deadline: u64,
    pub finalization_hash: Option<String>,
}

impl SessionRecord {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.origin_chain_id, self.origin_block_height)
    }

    pub fn row_id(&self) -> RowId {
        RowId {
            position: self.position,
            key: self.key(),
        }
    }

    pub fn to_request(&self) -> FinalizationRequest {
        FinalizationRequest::new(self.key(), self.deadline, self.position)
    }
}
