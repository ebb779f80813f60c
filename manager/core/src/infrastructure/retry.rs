// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Retry/Backoff Harness
//!
//! Uniform exponential-backoff retry wrapped around every outbound call.
//!
//! Rules:
//! - the first attempt is never delayed;
//! - an error is retried when its code is in the frozen retriable set, when the
//!   set holds the wildcard `"*"`, or when it is `ERR_AX_HTTP_CONNECTION`;
//! - the gap starts at `initial_gap` and is multiplied by `multiplier` up to `max_gap`;
//! - no new attempt starts once `timeout` has elapsed since the first one, so the
//!   total wall time is bounded by `timeout` plus one attempt;
//! - `None` configuration means call once.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Cross-cutting resilience for AXDB, ADC, AM and bus clients

use crate::domain::error::{codes, AxError, AxResult};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const RETRY_ANY: &str = "*";

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub timeout: Duration,
    pub initial_gap: Duration,
    pub max_gap: Duration,
    pub multiplier: f64,
    retriable_codes: Arc<HashSet<String>>,
}

impl RetryConfig {
    pub fn new<I, S>(
        timeout: Duration,
        initial_gap: Duration,
        max_gap: Duration,
        multiplier: f64,
        retriable_codes: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            timeout,
            initial_gap,
            max_gap,
            multiplier,
            retriable_codes: Arc::new(retriable_codes.into_iter().map(Into::into).collect()),
        }
    }

    /// 1s initial gap doubling to 60s, retrying connection failures only.
    pub fn connection_failures(timeout: Duration) -> Self {
        Self::new(
            timeout,
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            [codes::ERR_AX_HTTP_CONNECTION],
        )
    }

    /// Same backoff as [`RetryConfig::connection_failures`] but retries every typed error.
    pub fn any_error(timeout: Duration) -> Self {
        Self::new(
            timeout,
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            [RETRY_ANY],
        )
    }

    pub fn is_retriable(&self, code: &str) -> bool {
        code == codes::ERR_AX_HTTP_CONNECTION
            || self.retriable_codes.contains(RETRY_ANY)
            || self.retriable_codes.contains(code)
    }

    fn next_gap(&self, gap: Duration) -> Duration {
        let next = gap.mul_f64(self.multiplier.max(1.0));
        next.min(self.max_gap)
    }
}

/// Run `op` under `config`.
pub async fn retry<T, F, Fut>(config: Option<&RetryConfig>, op: F) -> AxResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AxResult<T>>,
{
    retry_until(config, None, op).await
}

/// Run `op` under `config`, abandoning the backoff sleep when `cancel` fires.
pub async fn retry_until<T, F, Fut>(
    config: Option<&RetryConfig>,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> AxResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AxResult<T>>,
{
    let Some(config) = config else {
        return op().await;
    };

    let started = Instant::now();
    let mut gap = config.initial_gap;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !config.is_retriable(err.code()) {
            debug!("Attempt {} failed with non-retriable error {}", attempt, err.code());
            return Err(err);
        }

        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            warn!(
                "Giving up after {} attempts in {:?}: {}",
                attempt, elapsed, err
            );
            return Err(err);
        }

        let sleep_for = gap.min(config.timeout - elapsed);
        warn!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempt, err, sleep_for
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(AxError::from_cause(err, codes::ERR_TIMEOUT, "retry cancelled"));
                    }
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
            None => tokio::time::sleep(sleep_for).await,
        }

        gap = config.next_gap(gap);
    }
}
