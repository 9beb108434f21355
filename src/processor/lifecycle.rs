//! Per-run tokens, the bounded queues between the pools, fatal error capture
//! and the metrics reporter.

use super::types::{FetchRequest, PersistUnit};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, QueueProbe, Telemetry};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Both ends of the request and unit queues for one run.
pub(crate) struct PipelineQueues {
    pub request_tx: flume::Sender<FetchRequest>,
    pub request_rx: flume::Receiver<FetchRequest>,
    pub unit_tx: flume::Sender<PersistUnit>,
    pub unit_rx: flume::Receiver<PersistUnit>,
}

impl PipelineQueues {
    /// Capacities match the consuming pool sizes, so at most one pending item
    /// waits per idle worker.
    fn bounded(fetch_workers: usize, persist_workers: usize) -> Self {
        let (request_tx, request_rx) = flume::bounded(fetch_workers);
        let (unit_tx, unit_rx) = flume::bounded(persist_workers);
        Self {
            request_tx,
            request_rx,
            unit_tx,
            unit_rx,
        }
    }

    fn probe(&self) -> QueueProbe {
        QueueProbe {
            requests: self.request_rx.clone(),
            units: self.unit_rx.clone(),
        }
    }
}

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    metrics_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub fetch_workers: usize,
    pub persist_workers: usize,
    pub metrics_interval: Duration,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> (Self, PipelineQueues) {
        let run_token = params.shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(params.shutdown_root.clone(), run_token.clone());
        let queues = PipelineQueues::bounded(params.fetch_workers, params.persist_workers);

        let metrics_handle = telemetry::spawn_metrics_reporter(
            params.telemetry,
            queues.probe(),
            run_token.clone(),
            params.metrics_interval,
        );

        let handles = Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
        };
        (handles, queues)
    }

    pub(crate) fn fatal_handler(&self) -> &FatalErrorHandler {
        &self.fatal_handler
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    /// Stops the reporter. Callers must have drained both pools first.
    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();
        let Some(handle) = self.metrics_handle.take() else {
            return;
        };
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "metrics reporter task panicked");
        }
    }
}
