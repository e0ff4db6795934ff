// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod chain;
pub mod config;
pub mod cursor;
pub mod error;
pub mod eth_client;
pub mod ingestion;
pub mod node;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod submitter;
pub mod types;

#[cfg(test)]
pub mod test_utils;
