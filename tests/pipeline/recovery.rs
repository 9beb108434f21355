use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{assert_is_contiguous, init_tracing, stream_heights, test_config, wait_for_state, wait_until},
    mock_source::{MockChain, MockRequest, MockSourceServer},
};
use anyhow::Result;
use cosmos_ingest::{
    ActivityLog, Checkpoint, FileActivityLog, Gap, GapError, LogRecord, MemoryActivityLog,
    MemoryStore, Pipeline, PipelineState, RecoveryError, RestSourceClient, Stream,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn stored(stream: Stream, heights: impl IntoIterator<Item = u64>) -> Vec<LogRecord> {
    heights
        .into_iter()
        .map(|height| LogRecord::stored(stream, height, &format!("id-{height}")))
        .collect()
}

fn pipeline_for(
    server: &MockSourceServer,
    log_path: PathBuf,
    checkpoint: Checkpoint,
    journal: Arc<dyn ActivityLog>,
) -> Result<Pipeline> {
    let config = test_config(server.url(), &log_path)
        .checkpoint(checkpoint)
        .build()?;
    let source = RestSourceClient::from_config(&config)?;
    Ok(Pipeline::new(
        config,
        Arc::new(source),
        Arc::new(MemoryStore::new()),
        journal,
    ))
}

/// Runs until every height in `heights` is settled on both streams, then stops.
async fn ingest(
    pipeline: Pipeline,
    journal: &dyn ActivityLog,
    heights: RangeInclusive<u64>,
) -> Result<Option<Gap>> {
    let mut states = pipeline.subscribe();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(pipeline.run(shutdown.clone()));

    wait_for_state(&mut states, PipelineState::WaitingForNewHeights, WAIT).await?;
    wait_until(WAIT, "both streams to settle", || {
        let records = journal.read_all().unwrap_or_default();
        let skipped = stream_heights(&records, Stream::Other);
        let settled = |stream| {
            let logged = stream_heights(&records, stream);
            heights
                .clone()
                .all(|height| logged.contains(&height) || skipped.contains(&height))
        };
        settled(Stream::Blocks) && settled(Stream::Transactions)
    })
    .await?;

    shutdown.cancel();
    let report = run.await??;
    Ok(report.start)
}

#[tokio::test]
async fn restart_resumes_after_the_last_logged_height() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let log_path = dir.path().join("ingest.log");
    let chain = MockChain::new(4);
    let server = MockSourceServer::start(chain.clone()).await?;

    let journal = Arc::new(FileActivityLog::open(&log_path)?);
    let first = pipeline_for(&server, log_path.clone(), Checkpoint::at(0), journal.clone())?;
    let start = ingest(first, journal.as_ref(), 1..=4).await?;
    assert_eq!(start, Some(Gap { tail: 1, head: 4 }));
    drop(journal);

    let already_seen = chain.requests().len();
    chain.set_head(6);

    let journal = Arc::new(FileActivityLog::open(&log_path)?);
    let second = pipeline_for(&server, log_path.clone(), Checkpoint::at(0), journal.clone())?;
    let start = ingest(second, journal.as_ref(), 5..=6).await?;
    assert_eq!(start, Some(Gap { tail: 5, head: 6 }));

    let refetched: Vec<MockRequest> = chain.requests()[already_seen..]
        .iter()
        .copied()
        .filter(|request| matches!(request.height(), Some(height) if height <= 4))
        .collect();
    assert!(refetched.is_empty(), "restart re-fetched {refetched:?}");

    let records = journal.read_all()?;
    assert_is_contiguous(&stream_heights(&records, Stream::Blocks), 1, 6);
    assert_is_contiguous(&stream_heights(&records, Stream::Transactions), 1, 6);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn skip_markers_keep_the_log_recoverable() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let log_path = dir.path().join("ingest.log");
    let chain = MockChain::new(5).with_unavailable([2]);
    let server = MockSourceServer::start(chain.clone()).await?;

    let journal = Arc::new(FileActivityLog::open(&log_path)?);
    let first = pipeline_for(&server, log_path.clone(), Checkpoint::at(0), journal.clone())?;
    ingest(first, journal.as_ref(), 1..=5).await?;
    drop(journal);

    let journal = Arc::new(FileActivityLog::open(&log_path)?);
    let second = pipeline_for(&server, log_path.clone(), Checkpoint::at(0), journal.clone())?;
    let mut states = second.subscribe();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(second.run(shutdown.clone()));
    wait_for_state(&mut states, PipelineState::WaitingForNewHeights, WAIT).await?;
    shutdown.cancel();
    let report = run.await??;

    assert_eq!(report.start, Some(Gap { tail: 6, head: 5 }));
    assert_eq!(report.next_height, Some(6));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn diverging_streams_abort_with_recovery_dumps() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let log_path = dir.path().join("ingest.log");
    let chain = MockChain::new(10);
    let server = MockSourceServer::start(chain.clone()).await?;

    let mut records = stored(Stream::Blocks, 1..=5);
    records.extend(stored(Stream::Transactions, 1..=3));
    let journal = Arc::new(MemoryActivityLog::with_records(records));
    let pipeline = pipeline_for(&server, log_path.clone(), Checkpoint::at(0), journal.clone())?;
    let states = pipeline.subscribe();

    let err = pipeline
        .run(CancellationToken::new())
        .await
        .expect_err("diverging streams must stop the pipeline");

    match err.downcast_ref::<RecoveryError>() {
        Some(RecoveryError::CrashDetected {
            last_blocks,
            last_transactions,
            dumps,
        }) => {
            assert_eq!((*last_blocks, *last_transactions), (5, 3));
            assert_eq!(dumps.len(), 2);
        }
        other => panic!("unexpected error {err:#} ({other:?})"),
    }
    assert_eq!(*states.borrow(), PipelineState::Stopped);

    let dump = std::fs::read_to_string(dir.path().join("ingest.log.bxs-dump"))?;
    assert_eq!(dump, "5\n4\n3\n2\n1\n");
    let dump = std::fs::read_to_string(dir.path().join("ingest.log.txs-dump"))?;
    assert_eq!(dump, "3\n2\n1\n");

    assert!(chain.requests().is_empty(), "no source traffic before recovery passes");
    assert_eq!(journal.stream(Stream::Other).len(), 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn checkpoint_covering_the_mismatch_resumes_above_it() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let chain = MockChain::new(7);
    let server = MockSourceServer::start(chain.clone()).await?;

    let mut records = stored(Stream::Blocks, 1..=5);
    records.extend(stored(Stream::Transactions, 1..=3));
    let journal = Arc::new(MemoryActivityLog::with_records(records));
    let pipeline = pipeline_for(&server, dir.path().join("ingest.log"), Checkpoint::at(5), journal.clone())?;

    let start = ingest(pipeline, journal.as_ref(), 6..=7).await?;
    assert_eq!(start, Some(Gap { tail: 6, head: 7 }));

    let requested = chain.requested_heights();
    assert!(requested.iter().all(|height| *height >= 6), "requested {requested:?}");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stored_state_ahead_of_the_source_is_rejected() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let chain = MockChain::new(5);
    let server = MockSourceServer::start(chain.clone()).await?;

    let mut records = stored(Stream::Blocks, 1..=10);
    records.extend(stored(Stream::Transactions, 1..=10));
    let journal = Arc::new(MemoryActivityLog::with_records(records));
    let pipeline = pipeline_for(&server, dir.path().join("ingest.log"), Checkpoint::at(0), journal)?;

    let err = pipeline
        .run(CancellationToken::new())
        .await
        .expect_err("resume above the source head must fail");
    assert_eq!(
        err.downcast_ref::<GapError>(),
        Some(&GapError::AheadOfSource { resume: 10, head: 5 })
    );
    assert_eq!(chain.requested_heights(), Vec::<u64>::new());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn a_second_instance_cannot_share_the_activity_log() -> Result<()> {
    let dir = TempDir::new()?;
    let log_path = dir.path().join("ingest.log");

    let held = FileActivityLog::open(&log_path)?;
    let err = FileActivityLog::open(&log_path).expect_err("log is already locked");
    assert!(format!("{err:#}").contains("another instance"), "{err:#}");

    drop(held);
    FileActivityLog::open(&log_path)?;
    Ok(())
}
