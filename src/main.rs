use anyhow::{Context, Result};
use cosmos_ingest::{
    init_tracing, FileActivityLog, IngestConfig, MongoStore, Pipeline, RestSourceClient, Runner,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = IngestConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        version = cosmos_ingest::VERSION,
        source = config.source_url(),
        database = config.store_database(),
        log = %config.log_path().display(),
        checkpoint = %config.checkpoint(),
        fetch_workers = config.fetch_workers(),
        persist_workers = config.persist_workers(),
        "starting cosmos-ingest"
    );

    let journal = FileActivityLog::open(config.log_path())?;

    let mut runner = Runner::new();
    runner.listen_for_signals();
    let shutdown = runner.cancellation_token();

    let store = match MongoStore::connect(
        config.store_uri(),
        config.store_database(),
        config.retry_backoff(),
        &shutdown,
    )
    .await
    {
        Ok(store) => store,
        Err(_) if shutdown.is_cancelled() => {
            tracing::info!("shutdown requested while connecting to the store");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let source = Arc::new(RestSourceClient::from_config(&config)?);
    let pipeline = Pipeline::new(config, source.clone(), Arc::new(store), Arc::new(journal));

    let report = runner.run(pipeline).await;
    let requests = source.metrics();
    tracing::info!(
        requests = requests.requests,
        failures = requests.failures,
        timeouts = requests.timeouts,
        unavailable = requests.unavailable,
        average_latency = %humantime::format_duration(requests.average_latency),
        "source client totals"
    );

    let report = report?;
    match report.next_height {
        Some(next_height) => tracing::info!(
            next_height,
            persisted_blocks = report.telemetry.persisted_blocks,
            persisted_transactions = report.telemetry.persisted_transactions,
            "cosmos-ingest stopped"
        ),
        None => tracing::info!("cosmos-ingest stopped before ingestion started"),
    }
    Ok(())
}
