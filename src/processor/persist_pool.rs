//! Persist workers: write units to the store and log the outcome.

use super::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition, RetryError};
use super::types::PersistUnit;
use super::worker_pool::WorkerPool;
use crate::journal::{ActivityLog, LogRecord};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::Telemetry;
use crate::store::DocumentStore;
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) struct PersistPoolParams {
    pub size: usize,
    pub store: Arc<dyn DocumentStore>,
    pub journal: Arc<dyn ActivityLog>,
    pub units: flume::Receiver<PersistUnit>,
    pub shutdown: CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub retry_backoff: Duration,
}

pub(crate) fn launch(params: PersistPoolParams, fatal_handler: &FatalErrorHandler) -> WorkerPool {
    let PersistPoolParams {
        size,
        store,
        journal,
        units,
        shutdown,
        telemetry,
        retry_backoff,
    } = params;

    WorkerPool::launch("persist", size, fatal_handler, move |id| {
        PersistWorker {
            id,
            store: store.clone(),
            journal: journal.clone(),
            units: units.clone(),
            shutdown: shutdown.clone(),
            telemetry: telemetry.clone(),
            retry_backoff,
        }
        .run()
    })
}

pub(crate) struct PersistWorker {
    id: usize,
    store: Arc<dyn DocumentStore>,
    journal: Arc<dyn ActivityLog>,
    units: flume::Receiver<PersistUnit>,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
    retry_backoff: Duration,
}

impl PersistWorker {
    /// Consumes units until every fetch worker has dropped its sender. Units
    /// received after cancellation still get one insert attempt; only the
    /// retries are skipped.
    #[tracing::instrument(name = "persist_worker", skip_all, fields(worker = self.id))]
    pub(crate) async fn run(self) -> Result<()> {
        tracing::debug!("persist worker started");

        while let Ok(unit) = self.units.recv_async().await {
            match self.persist(&unit).await? {
                Some(id) => {
                    self.telemetry.record_persisted(unit.kind);
                    tracing::debug!(height = unit.height, kind = %unit.kind, id = %id, "unit stored");
                }
                None => {
                    self.telemetry.record_cancelled_unit();
                    tracing::debug!(height = unit.height, kind = %unit.kind, "unit abandoned after cancellation");
                }
            }
        }

        tracing::debug!("persist queue closed; worker exiting");
        Ok(())
    }

    /// Returns the store id, or `None` if cancellation cut the retries short.
    async fn persist(&self, unit: &PersistUnit) -> Result<Option<String>> {
        let document: Value = serde_json::from_slice(&unit.payload).with_context(|| {
            format!(
                "{} payload at height {} is not valid JSON",
                unit.kind, unit.height
            )
        })?;

        let telemetry = &self.telemetry;
        let outcome = retry_with_backoff(
            RetryBackoff::fixed(self.retry_backoff).with_cancellation(&self.shutdown),
            |_| self.store.insert(&unit.destination, &document),
            |attempt, delay, err| {
                telemetry.record_store_retry();
                tracing::warn!(
                    height = unit.height,
                    kind = %unit.kind,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "store write failed; retrying"
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

        let id = match outcome {
            Ok(id) => id,
            Err(RetryError::Cancelled) => return Ok(None),
            Err(RetryError::Aborted(err)) => {
                return Err(anyhow::Error::new(err).context(format!(
                    "failed to store {} at height {}",
                    unit.kind, unit.height
                )))
            }
        };

        self.journal
            .append(&LogRecord::stored(unit.kind.stream(), unit.height, &id))
            .with_context(|| format!("failed to log stored {} {}", unit.kind, unit.height))?;
        Ok(Some(id))
    }
}
