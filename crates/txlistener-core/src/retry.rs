//! Exponential backoff retry policy and a retrying `ChainReader` decorator.
//!
//! The listener engine never retries on its own: a failed read is final for
//! the operation that issued it. Wrap the node-backed reader in a
//! [`RetryingReader`] to absorb transient failures before they reach it.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ReadError;
use crate::reader::ChainReader;
use crate::types::{Block, ChainId, Header, Receipt};

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Add ±`jitter_fraction * backoff` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
    /// Treat an unknown receipt as a retryable "not found".
    pub retry_missing_receipts: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.1,
            retry_missing_receipts: true,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        let capped = base_ms.min(cap_ms);

        let jitter_ms = capped * self.config.jitter_fraction * jitter_unit();
        let total_ms = (capped + jitter_ms).max(0.0) as u64;

        Some(Duration::from_millis(total_ms))
    }
}

/// A value in `[-1.0, 1.0)` derived from the clock's sub-second part.
fn jitter_unit() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 2_000) as f64 / 1_000.0 - 1.0
}

/// Wraps a [`ChainReader`] and retries retryable failures with backoff.
///
/// Non-retryable kinds (`InvalidResponse`, `Rpc`, `Other`) are returned at
/// once. Cancelling the token stops waiting between attempts and returns the
/// last error.
pub struct RetryingReader<R> {
    inner: R,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<R: ChainReader> RetryingReader<R> {
    pub fn new(inner: R, config: RetryConfig) -> Self {
        Self {
            inner,
            policy: RetryPolicy::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort pending backoff waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, ReadError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ReadError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };
            attempt += 1;
            let Some(delay) = self.policy.next_delay(attempt) else {
                tracing::warn!(op, attempts = attempt, error = %err, "Giving up after retries");
                return Err(err);
            };
            tracing::warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying chain read");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl<R: ChainReader> ChainReader for RetryingReader<R> {
    async fn header_by_number(
        &self,
        chain_id: &ChainId,
        number: Option<u64>,
    ) -> Result<Header, ReadError> {
        let inner = &self.inner;
        self.retry("header_by_number", move || inner.header_by_number(chain_id, number))
            .await
    }

    async fn block_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<Block>, ReadError> {
        let inner = &self.inner;
        self.retry("block_by_number", move || inner.block_by_number(chain_id, number))
            .await
    }

    async fn transaction_receipt(
        &self,
        chain_id: &ChainId,
        tx_hash: &str,
    ) -> Result<Option<Receipt>, ReadError> {
        let inner = &self.inner;
        let retry_missing = self.policy.config.retry_missing_receipts;
        let result = self
            .retry("transaction_receipt", move || async move {
                match inner.transaction_receipt(chain_id, tx_hash).await? {
                    None if retry_missing => {
                        Err(ReadError::not_found(format!("receipt {tx_hash}")))
                    }
                    other => Ok(other),
                }
            })
            .await;
        match result {
            // Exhausted retries on a missing receipt: report it as missing.
            Err(err) if retry_missing && err.kind == crate::error::ReadErrorKind::NotFound => Ok(None),
            other => other,
        }
    }
}
