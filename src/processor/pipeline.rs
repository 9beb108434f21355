//! Pipeline orchestration: recovery, height generation, pool lifecycle and
//! draining.

use super::fetch_pool::{self, FetchPoolParams};
use super::gap::Gap;
use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams, PipelineQueues};
use super::persist_pool::{self, PersistPoolParams};
use super::tip::{HeadPoller, SourceHead};
use super::types::{Destinations, FetchRequest};
use crate::journal::{ActivityLog, LogRecord, RecoveryValidator};
use crate::runtime::config::IngestConfig;
use crate::runtime::telemetry::{Telemetry, TelemetrySnapshot};
use crate::source::BlockSource;
use crate::store::DocumentStore;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Validating the activity log and reading the source head.
    Recovering,
    CatchingUp,
    WaitingForNewHeights,
    Draining,
    Stopped,
}

/// Summary returned once the pipeline has stopped.
#[derive(Debug, Clone, Copy)]
pub struct PipelineReport {
    /// Range computed at startup; `None` if shutdown came before it was known.
    pub start: Option<Gap>,
    /// First height that was never enqueued.
    pub next_height: Option<u64>,
    pub telemetry: TelemetrySnapshot,
}

pub struct Pipeline {
    config: IngestConfig,
    source: Arc<dyn BlockSource>,
    store: Arc<dyn DocumentStore>,
    journal: Arc<dyn ActivityLog>,
    telemetry: Arc<Telemetry>,
    head: Arc<SourceHead>,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(
        config: IngestConfig,
        source: Arc<dyn BlockSource>,
        store: Arc<dyn DocumentStore>,
        journal: Arc<dyn ActivityLog>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Recovering);
        Self {
            config,
            source,
            store,
            journal,
            telemetry: Arc::new(Telemetry::default()),
            head: Arc::new(SourceHead::new()),
            state,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn source_head(&self) -> Arc<SourceHead> {
        self.head.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Runs until `shutdown` fires or a fatal error occurs, then drains both
    /// pools before returning. A captured fatal error is returned after the
    /// drain completes.
    pub async fn run(self, shutdown: CancellationToken) -> Result<PipelineReport> {
        self.publish(PipelineState::Recovering);

        let start = match self.resume_gap(&shutdown).await {
            Ok(Some(gap)) => gap,
            Ok(None) => {
                tracing::info!("shutdown requested before ingestion started");
                self.publish(PipelineState::Stopped);
                return Ok(PipelineReport {
                    start: None,
                    next_height: None,
                    telemetry: self.telemetry.snapshot(),
                });
            }
            Err(err) => {
                self.publish(PipelineState::Stopped);
                return Err(err);
            }
        };

        self.journal
            .append(&LogRecord::note([
                "started".to_string(),
                crate::VERSION.to_string(),
                start.tail.to_string(),
                start.head.to_string(),
            ]))
            .context("failed to write to activity log")?;

        let (lifecycle, queues) = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &shutdown,
            telemetry: self.telemetry.clone(),
            fetch_workers: self.config.fetch_workers(),
            persist_workers: self.config.persist_workers(),
            metrics_interval: self.config.metrics_interval(),
        });
        let run_token = lifecycle.run_token.clone();
        let PipelineQueues {
            request_tx,
            request_rx,
            unit_tx,
            unit_rx,
        } = queues;

        let fetch_pool = fetch_pool::launch(
            FetchPoolParams {
                size: self.config.fetch_workers(),
                source: self.source.clone(),
                journal: self.journal.clone(),
                destinations: Destinations::new(
                    self.config.blocks_collection(),
                    self.config.transactions_collection(),
                ),
                requests: request_rx,
                units: unit_tx,
                shutdown: run_token.clone(),
                telemetry: self.telemetry.clone(),
                retry_backoff: self.config.retry_backoff(),
            },
            lifecycle.fatal_handler(),
        );
        let persist_pool = persist_pool::launch(
            PersistPoolParams {
                size: self.config.persist_workers(),
                store: self.store.clone(),
                journal: self.journal.clone(),
                units: unit_rx,
                shutdown: run_token.clone(),
                telemetry: self.telemetry.clone(),
                retry_backoff: self.config.retry_backoff(),
            },
            lifecycle.fatal_handler(),
        );

        tracing::info!(
            tail = start.tail,
            head = start.head,
            fetch_workers = fetch_pool.size(),
            persist_workers = persist_pool.size(),
            "ingestion started"
        );

        let mut cursor = start;
        if let Err(err) = self.drive(&mut cursor, &request_tx, &run_token).await {
            lifecycle.fatal_handler().trigger("orchestrator", err);
        }

        self.publish(PipelineState::Draining);
        tracing::info!(next_height = cursor.tail, "draining pipeline");
        drop(request_tx);
        fetch_pool.join().await;
        persist_pool.join().await;

        let fatal = lifecycle.error();
        lifecycle.shutdown().await;

        if let Err(err) = self.journal.append(&LogRecord::note(["stopped"])) {
            tracing::warn!(error = %err, "failed to note shutdown in activity log");
        }
        self.publish(PipelineState::Stopped);

        if let Some(err) = fatal {
            return Err(err.context("ingestion pipeline aborted"));
        }

        let report = PipelineReport {
            start: Some(start),
            next_height: Some(cursor.tail),
            telemetry: self.telemetry.snapshot(),
        };
        tracing::info!(
            next_height = cursor.tail,
            fetched = report.telemetry.fetched_heights,
            cancelled = report.telemetry.cancelled_requests + report.telemetry.cancelled_units,
            "pipeline stopped"
        );
        Ok(report)
    }

    async fn resume_gap(&self, shutdown: &CancellationToken) -> Result<Option<Gap>> {
        let checkpoint = self.config.checkpoint();
        let records = self
            .journal
            .read_all()
            .context("failed to read activity log")?;
        let outcome = RecoveryValidator::new(checkpoint, self.config.log_path())
            .validate(&records)
            .context("activity log recovery failed")?;

        let Some(head) = self.poller(shutdown).fetch().await? else {
            return Ok(None);
        };

        let gap = Gap::compute(outcome, checkpoint, head).context("cannot resume ingestion")?;
        Ok(Some(gap))
    }

    /// Enqueues heights as capacity allows and waits for the source head to
    /// advance whenever the range is exhausted. Returns on cancellation.
    async fn drive(
        &self,
        cursor: &mut Gap,
        requests: &flume::Sender<FetchRequest>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let poller = self.poller(shutdown);

        loop {
            if !cursor.is_empty() {
                self.publish(PipelineState::CatchingUp);
                tracing::info!(tail = cursor.tail, head = cursor.head, "queuing heights");
            }

            while !cursor.is_empty() {
                let request = FetchRequest {
                    height: cursor.tail,
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(()),
                    sent = requests.send_async(request) => {
                        sent.map_err(|_| {
                            anyhow!("fetch queue closed while queuing height {}", request.height)
                        })?;
                    }
                }
                cursor.tail += 1;
            }

            self.publish(PipelineState::WaitingForNewHeights);
            match poller.wait_for_advance(cursor.head).await? {
                Some(head) => cursor.head = head,
                None => return Ok(()),
            }
        }
    }

    fn poller<'a>(&'a self, shutdown: &'a CancellationToken) -> HeadPoller<'a> {
        HeadPoller {
            source: self.source.as_ref(),
            head: &self.head,
            telemetry: &self.telemetry,
            poll_interval: self.config.poll_interval(),
            retry_backoff: self.config.retry_backoff(),
            shutdown,
        }
    }

    fn publish(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, current = ?state, "pipeline state changed");
        }
    }
}
