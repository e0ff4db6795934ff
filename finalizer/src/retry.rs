// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry with exponential backoff.
//!
//! Operations report one of three results per attempt:
//! - `Ok(Attempt::Done(v))`: finished, `v` is returned
//! - `Ok(Attempt::RetryAfter(d))`: a self-correcting condition was handled (nonce refetched, gas
//!   escalated); retry after `d`, without growing the backoff
//! - `Err(e)`: generic failure; retry after the next exponential backoff delay
//!
//! Every retry consumes the same budget.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{debug, warn};

use crate::error::FinalizerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    RetryAfter(Duration),
}

impl<T> Attempt<T> {
    pub fn retry_now() -> Self {
        Attempt::RetryAfter(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 1s, 2s, ... with +/-50% jitter
        Self {
            max_retries: 2,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            // The attempt budget bounds retries, not wall-clock time
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Attempt<T>>>,
{
    let mut backoff = policy.backoff();
    let max_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let delay = match op().await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::RetryAfter(delay)) => {
                if attempt >= max_attempts {
                    return Err(FinalizerError::RetriesExhausted {
                        operation: label.to_string(),
                        attempts: attempt,
                    }
                    .into());
                }
                debug!(
                    "[Retry] {} asked to retry in {:?} (attempt {}/{})",
                    label, delay, attempt, max_attempts
                );
                delay
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(policy.initial_interval);
                warn!(
                    "[Retry] {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    label, attempt, max_attempts, delay, e
                );
                delay
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
