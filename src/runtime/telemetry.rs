use crate::processor::types::{FetchRequest, PersistKind, PersistUnit};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a fmt subscriber honouring `RUST_LOG` (falling back to `info`).
/// Safe to call more than once.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Relaxed counters describing pipeline progress.
#[derive(Default, Debug)]
pub struct Telemetry {
    fetched_heights: AtomicU64,
    persisted_blocks: AtomicU64,
    persisted_transactions: AtomicU64,
    empty_transactions: AtomicU64,
    unavailable_heights: AtomicU64,
    source_retries: AtomicU64,
    store_retries: AtomicU64,
    cancelled_requests: AtomicU64,
    cancelled_units: AtomicU64,
}

impl Telemetry {
    pub fn record_fetched_height(&self) {
        self.fetched_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, kind: PersistKind) {
        let counter = match kind {
            PersistKind::Block => &self.persisted_blocks,
            PersistKind::Transactions => &self.persisted_transactions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_transactions(&self) {
        self.empty_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable_height(&self) {
        self.unavailable_heights.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_retry(&self) {
        self.source_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_retry(&self) {
        self.store_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled_request(&self) {
        self.cancelled_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled_unit(&self) {
        self.cancelled_units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fetched_heights: self.fetched_heights.load(Ordering::Relaxed),
            persisted_blocks: self.persisted_blocks.load(Ordering::Relaxed),
            persisted_transactions: self.persisted_transactions.load(Ordering::Relaxed),
            empty_transactions: self.empty_transactions.load(Ordering::Relaxed),
            unavailable_heights: self.unavailable_heights.load(Ordering::Relaxed),
            source_retries: self.source_retries.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            cancelled_units: self.cancelled_units.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub fetched_heights: u64,
    pub persisted_blocks: u64,
    pub persisted_transactions: u64,
    pub empty_transactions: u64,
    pub unavailable_heights: u64,
    pub source_retries: u64,
    pub store_retries: u64,
    pub cancelled_requests: u64,
    pub cancelled_units: u64,
}

/// Read-only handles onto the pipeline queues, for depth reporting.
#[derive(Clone)]
pub struct QueueProbe {
    pub(crate) requests: flume::Receiver<FetchRequest>,
    pub(crate) units: flume::Receiver<PersistUnit>,
}

/// Spawns a task that logs throughput, counters and queue depths every
/// `interval` until `shutdown` fires.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    queues: QueueProbe,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "cosmos_ingest::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let fetched_delta = current
                        .fetched_heights
                        .saturating_sub(last_snapshot.fetched_heights);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let heights_per_sec = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        fetched_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "cosmos_ingest::metrics",
                        heights_per_sec = format!("{heights_per_sec:.2}"),
                        fetched = current.fetched_heights,
                        blocks = current.persisted_blocks,
                        transactions = current.persisted_transactions,
                        empty_transactions = current.empty_transactions,
                        unavailable = current.unavailable_heights,
                        source_retries = current.source_retries,
                        store_retries = current.store_retries,
                        fetch_queue = queues.requests.len(),
                        persist_queue = queues.units.len(),
                        "ingestion metrics"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
