use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    assert_is_contiguous, init_tracing, stream_heights, test_config, wait_for_state, wait_until,
    GatedSource,
};
use anyhow::Result;
use cosmos_ingest::{
    MemoryActivityLog, MemoryStore, Pipeline, PipelineState, Runner, ShutdownRequest, Stream,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);
const GATE: u64 = 40;

fn gated_pipeline(
    dir: &TempDir,
    source: Arc<GatedSource>,
) -> Result<(Pipeline, Arc<MemoryActivityLog>, Arc<MemoryStore>)> {
    let config = test_config("http://127.0.0.1:1", &dir.path().join("ingest.log")).build()?;
    let journal = Arc::new(MemoryActivityLog::new());
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(config, source, store.clone(), journal.clone());
    Ok((pipeline, journal, store))
}

#[tokio::test]
async fn graceful_shutdown_drains_without_fetching_new_heights() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let source = Arc::new(GatedSource::new(1_000, GATE));
    let (pipeline, journal, store) = gated_pipeline(&dir, source.clone())?;
    let mut states = pipeline.subscribe();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(pipeline.run(shutdown.clone()));

    wait_for_state(&mut states, PipelineState::CatchingUp, WAIT).await?;
    wait_until(WAIT, "every height below the gate", || {
        let records = journal.records();
        stream_heights(&records, Stream::Blocks).len() == GATE as usize
            && stream_heights(&records, Stream::Transactions).len() == GATE as usize
    })
    .await?;

    shutdown.cancel();
    let report = run.await??;
    assert_eq!(*states.borrow(), PipelineState::Stopped);

    let next_height = report.next_height.expect("ingestion started");
    assert!(next_height > GATE + 1, "queue never filled: {next_height}");

    let records = journal.records();
    assert_is_contiguous(&stream_heights(&records, Stream::Blocks), 1, GATE);
    assert_is_contiguous(&stream_heights(&records, Stream::Transactions), 1, GATE);
    assert_eq!(store.len("blocks"), GATE as usize);
    assert_eq!(store.len("transactions"), GATE as usize);

    let requested = source.requested_heights();
    assert!(
        requested.iter().all(|height| *height < next_height),
        "fetched a height that was never queued: {requested:?}"
    );

    let telemetry = report.telemetry;
    assert_eq!(telemetry.fetched_heights, GATE);
    assert_eq!(telemetry.cancelled_requests, next_height - GATE - 1);
    assert_eq!(telemetry.cancelled_units, 0);
    assert!(telemetry.source_retries > 0);

    let notes = journal.stream(Stream::Other);
    assert_eq!(notes.last().and_then(|note| note.subject()), Some("stopped"));
    Ok(())
}

#[tokio::test]
async fn runner_stops_the_pipeline_when_its_token_is_cancelled() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let source = Arc::new(GatedSource::new(1_000, GATE));
    let (pipeline, journal, _store) = gated_pipeline(&dir, source.clone())?;
    let mut states = pipeline.subscribe();

    let runner = Runner::new();
    let controller = runner.controller();
    let run = tokio::spawn(runner.run(pipeline));

    wait_for_state(&mut states, PipelineState::CatchingUp, WAIT).await?;
    wait_until(WAIT, "some progress", || {
        !stream_heights(&journal.records(), Stream::Blocks).is_empty()
    })
    .await?;

    assert_eq!(controller.request(), ShutdownRequest::Graceful);
    let report = run.await??;
    assert!(report.next_height.is_some());
    assert_eq!(*states.borrow(), PipelineState::Stopped);
    Ok(())
}

#[tokio::test]
async fn shutdown_before_the_first_height_queues_nothing() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let source = Arc::new(GatedSource::new(1_000, GATE));
    let (pipeline, journal, store) = gated_pipeline(&dir, source.clone())?;

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let report = pipeline.run(shutdown).await?;

    assert_eq!(report.next_height, Some(1));
    assert!(source.requested_heights().is_empty());
    assert!(store.is_empty());
    assert!(stream_heights(&journal.records(), Stream::Blocks).is_empty());
    Ok(())
}
