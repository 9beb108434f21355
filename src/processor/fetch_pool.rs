//! Fetch workers: turn a height into zero, one or two persist units.

use super::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition, RetryError};
use super::types::{Destinations, FetchRequest, PersistKind, PersistUnit};
use super::worker_pool::WorkerPool;
use crate::journal::{ActivityLog, LogRecord};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::Telemetry;
use crate::source::{BlockSource, SourceError};
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) struct FetchPoolParams {
    pub size: usize,
    pub source: Arc<dyn BlockSource>,
    pub journal: Arc<dyn ActivityLog>,
    pub destinations: Destinations,
    pub requests: flume::Receiver<FetchRequest>,
    pub units: flume::Sender<PersistUnit>,
    pub shutdown: CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub retry_backoff: Duration,
}

/// Starts the pool. Each worker holds its own clone of the unit sender, so
/// the persist queue closes once the last fetch worker has returned.
pub(crate) fn launch(params: FetchPoolParams, fatal_handler: &FatalErrorHandler) -> WorkerPool {
    let FetchPoolParams {
        size,
        source,
        journal,
        destinations,
        requests,
        units,
        shutdown,
        telemetry,
        retry_backoff,
    } = params;

    WorkerPool::launch("fetch", size, fatal_handler, move |id| {
        FetchWorker {
            id,
            source: source.clone(),
            journal: journal.clone(),
            destinations: destinations.clone(),
            requests: requests.clone(),
            units: units.clone(),
            shutdown: shutdown.clone(),
            telemetry: telemetry.clone(),
            retry_backoff,
        }
        .run()
    })
}

#[derive(Debug, PartialEq, Eq)]
enum FetchOutcome {
    Enqueued { units: usize },
    Unavailable,
    Cancelled,
}

pub(crate) struct FetchWorker {
    id: usize,
    source: Arc<dyn BlockSource>,
    journal: Arc<dyn ActivityLog>,
    destinations: Destinations,
    requests: flume::Receiver<FetchRequest>,
    units: flume::Sender<PersistUnit>,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
    retry_backoff: Duration,
}

impl FetchWorker {
    #[tracing::instrument(name = "fetch_worker", skip_all, fields(worker = self.id))]
    pub(crate) async fn run(self) -> Result<()> {
        tracing::debug!("fetch worker started");

        while let Ok(request) = self.requests.recv_async().await {
            let height = request.height;

            if self.shutdown.is_cancelled() {
                self.telemetry.record_cancelled_request();
                tracing::debug!(height, "discarding queued height during drain");
                continue;
            }

            match self.fetch_height(height).await? {
                FetchOutcome::Enqueued { units } => {
                    self.telemetry.record_fetched_height();
                    tracing::debug!(height, units, "height fetched");
                }
                FetchOutcome::Unavailable => {}
                FetchOutcome::Cancelled => {
                    self.telemetry.record_cancelled_request();
                    tracing::debug!(height, "fetch abandoned after cancellation");
                }
            }
        }

        tracing::debug!("fetch queue closed; worker exiting");
        Ok(())
    }

    async fn fetch_height(&self, height: u64) -> Result<FetchOutcome> {
        let block = match self
            .with_retry(height, PersistKind::Block, |_| self.source.block_at(height))
            .await
        {
            Ok(block) => block,
            Err(err) => return self.settle_failure(height, PersistKind::Block, err),
        };

        let transactions = match self
            .with_retry(height, PersistKind::Transactions, |_| {
                self.source.transactions_at(height)
            })
            .await
        {
            Ok(transactions) => transactions,
            Err(err) => return self.settle_failure(height, PersistKind::Transactions, err),
        };

        self.enqueue(self.destinations.unit(height, PersistKind::Block, block))
            .await?;

        match transactions {
            Some(payload) => {
                self.enqueue(
                    self.destinations
                        .unit(height, PersistKind::Transactions, payload),
                )
                .await?;
                Ok(FetchOutcome::Enqueued { units: 2 })
            }
            None => {
                self.journal
                    .append(&LogRecord::empty_transactions(height))
                    .with_context(|| format!("failed to log empty transactions at {height}"))?;
                self.telemetry.record_empty_transactions();
                Ok(FetchOutcome::Enqueued { units: 1 })
            }
        }
    }

    async fn with_retry<'s, T, F>(
        &'s self,
        height: u64,
        kind: PersistKind,
        operation: F,
    ) -> Result<T, RetryError<SourceError>>
    where
        F: FnMut(usize) -> BoxFuture<'s, Result<T, SourceError>>,
    {
        let telemetry = &self.telemetry;
        retry_with_backoff(
            RetryBackoff::fixed(self.retry_backoff).with_cancellation(&self.shutdown),
            operation,
            |attempt, delay, err| {
                telemetry.record_source_retry();
                tracing::warn!(
                    height,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "failed to fetch {}; retrying",
                    kind
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
        .await
    }

    /// Maps a failed fetch to an outcome: unavailable heights are logged and
    /// skipped, cancellation is reported, everything else is fatal.
    fn settle_failure(
        &self,
        height: u64,
        kind: PersistKind,
        err: RetryError<SourceError>,
    ) -> Result<FetchOutcome> {
        match err {
            RetryError::Cancelled => Ok(FetchOutcome::Cancelled),
            RetryError::Aborted(SourceError::HeightUnavailable { message, .. }) => {
                self.journal
                    .append(&LogRecord::invalid(height, message.as_str()))
                    .with_context(|| format!("failed to log unavailable height {height}"))?;
                self.telemetry.record_unavailable_height();
                tracing::warn!(height, reason = %message, "height not available at source; skipping");
                Ok(FetchOutcome::Unavailable)
            }
            RetryError::Aborted(err) => {
                Err(anyhow::Error::new(err).context(format!("failed to fetch {kind} at height {height}")))
            }
        }
    }

    async fn enqueue(&self, unit: PersistUnit) -> Result<()> {
        let (height, kind) = (unit.height, unit.kind);
        self.units
            .send_async(unit)
            .await
            .map_err(|_| anyhow!("persist queue closed before {kind} {height} was handed off"))
    }
}
