use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use cosmos_ingest::{
    BlockSource, IngestConfig, IngestConfigBuilder, LogRecord, PipelineState, SourceError, Stream,
};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Small pools and short delays so scenarios finish quickly.
pub fn test_config(source_url: &str, log_path: &Path) -> IngestConfigBuilder {
    IngestConfig::builder()
        .source_url(source_url)
        .log_path(log_path)
        .workers(4)
        .retry_backoff(Duration::from_millis(20))
        .poll_interval(Duration::from_millis(50))
        .request_timeout(Duration::from_secs(5))
}

pub async fn wait_for_state(
    states: &mut watch::Receiver<PipelineState>,
    wanted: PipelineState,
    limit: Duration,
) -> Result<()> {
    let reached = timeout(limit, states.wait_for(|state| *state == wanted))
        .await
        .map(|result| result.is_ok());
    match reached {
        Ok(true) => Ok(()),
        Ok(false) => bail!("pipeline dropped before reaching {wanted:?}"),
        Err(_) => {
            let last = *states.borrow();
            bail!("timed out waiting for {wanted:?}; last state {last:?}")
        }
    }
}

/// Polls `condition` every 10ms until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Sorted subject heights of the records on `stream`, skipping notes.
pub fn stream_heights(records: &[LogRecord], stream: Stream) -> Vec<u64> {
    let mut heights: Vec<u64> = records
        .iter()
        .filter(|record| record.stream == stream)
        .filter(|record| stream != Stream::Other || record.is_invalid_marker())
        .filter_map(|record| record.subject()?.parse().ok())
        .collect();
    heights.sort_unstable();
    heights
}

pub fn assert_is_contiguous(heights: &[u64], first: u64, last: u64) {
    let expected: Vec<u64> = (first..=last).collect();
    assert_eq!(heights, expected.as_slice(), "heights are not {first}..={last}");
}

/// In-process source that serves every height up to `gate` and fails with a
/// transport error above it, so heights beyond the gate stay in flight.
pub struct GatedSource {
    head: u64,
    gate: AtomicU64,
    requests: Mutex<Vec<u64>>,
}

impl GatedSource {
    pub fn new(head: u64, gate: u64) -> Self {
        Self {
            head,
            gate: AtomicU64::new(gate),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requested_heights(&self) -> Vec<u64> {
        self.requests.lock().expect("gated source poisoned").clone()
    }

    fn serve(&self, height: u64) -> Result<(), SourceError> {
        self.requests
            .lock()
            .expect("gated source poisoned")
            .push(height);
        if height > self.gate.load(Ordering::SeqCst) {
            return Err(SourceError::Transport(anyhow!(
                "connection reset while fetching {height}"
            )));
        }
        Ok(())
    }
}

impl BlockSource for GatedSource {
    fn current_height(&self) -> BoxFuture<'_, Result<u64, SourceError>> {
        Box::pin(async move { Ok(self.head) })
    }

    fn block_at(&self, height: u64) -> BoxFuture<'_, Result<Bytes, SourceError>> {
        Box::pin(async move {
            self.serve(height)?;
            Ok(Bytes::from(format!(
                r#"{{"block":{{"header":{{"height":"{height}"}}}}}}"#
            )))
        })
    }

    fn transactions_at(&self, height: u64) -> BoxFuture<'_, Result<Option<Bytes>, SourceError>> {
        Box::pin(async move {
            self.serve(height)?;
            Ok(Some(Bytes::from(format!(
                r#"{{"txs":[{{}}],"pagination":{{"total":"1"}},"height":"{height}"}}"#
            ))))
        })
    }
}
