//! Source head tracking for the orchestrator.

use super::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition, RetryError};
use crate::runtime::telemetry::Telemetry;
use crate::source::BlockSource;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Highest source height observed so far. Never moves backwards.
#[derive(Debug, Default)]
pub struct SourceHead {
    value: AtomicU64,
    ready: AtomicBool,
}

impl SourceHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, height: u64) {
        self.value.fetch_max(height, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<u64> {
        if self.ready.load(Ordering::SeqCst) {
            Some(self.value.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

pub(crate) struct HeadPoller<'a> {
    pub source: &'a dyn BlockSource,
    pub head: &'a SourceHead,
    pub telemetry: &'a Telemetry,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub shutdown: &'a CancellationToken,
}

impl HeadPoller<'_> {
    /// Asks the source for its height, retrying transport failures. `None`
    /// means cancellation fired first.
    pub(crate) async fn fetch(&self) -> Result<Option<u64>> {
        let outcome = retry_with_backoff(
            RetryBackoff::fixed(self.retry_backoff).with_cancellation(self.shutdown),
            |_| self.source.current_height(),
            |attempt, delay, err| {
                self.telemetry.record_source_retry();
                tracing::warn!(
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "failed to read source height; retrying"
                );
            },
            |_, err| {
                if err.is_retryable() {
                    RetryDisposition::Retry
                } else {
                    RetryDisposition::Abort
                }
            },
        )
        .await;

        match outcome {
            Ok(height) => {
                self.head.update(height);
                Ok(Some(height))
            }
            Err(RetryError::Cancelled) => Ok(None),
            Err(RetryError::Aborted(err)) => {
                Err(err).context("failed to read source height")
            }
        }
    }

    /// Sleeps one poll interval at a time until the source reports a height
    /// above `known`.
    pub(crate) async fn wait_for_advance(&self, known: u64) -> Result<Option<u64>> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = sleep(self.poll_interval) => {}
            }

            let Some(height) = self.fetch().await? else {
                return Ok(None);
            };
            if height > known {
                tracing::debug!(previous = known, head = height, "source head advanced");
                return Ok(Some(height));
            }
            tracing::debug!(head = height, "no new heights at source");
        }
    }
}
