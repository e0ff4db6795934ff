// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinalizerError {
    // RPC endpoint unreachable or returned an unparseable response
    #[error("transport error: {0}")]
    Transport(String),
    // Chain rejected the transaction with a structured JSON-RPC error we do not handle
    #[error("chain rejected transaction (code {code}): {message}")]
    ChainRejected { code: i64, message: String },
    // The retry budget was spent on self-correcting conditions (stale nonce, slow inclusion)
    // without reaching a result
    #[error("{operation} did not complete after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },
}

impl FinalizerError {
    /// Returns a short string identifying the error type, used as a structured log field
    pub fn error_type(&self) -> &'static str {
        match self {
            FinalizerError::Transport(_) => "transport",
            FinalizerError::ChainRejected { .. } => "chain_rejected",
            FinalizerError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}
