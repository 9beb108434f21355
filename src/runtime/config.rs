use crate::journal::Checkpoint;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "COSMOS_INGEST_";

const DEFAULT_SOURCE_URL: &str = "http://localhost:1317";
const DEFAULT_STORE_URI: &str = "mongodb://localhost:27017";
const DEFAULT_STORE_DATABASE: &str = "cosmos-scraper";
const DEFAULT_BLOCKS_COLLECTION: &str = "blocks";
const DEFAULT_TRANSACTIONS_COLLECTION: &str = "transactions";
const DEFAULT_LOG_FILE: &str = "cosmos-ingest.log";
const DEFAULT_WORKERS: usize = 100;
const DEFAULT_RETRY_BACKOFF_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Runtime configuration for the ingestion pipeline.
///
/// Instances are only built through [`IngestConfig::builder`],
/// [`IngestConfig::new`] or [`IngestConfig::from_env`], all of which validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    source_url: String,
    store_uri: String,
    store_database: String,
    blocks_collection: String,
    transactions_collection: String,
    log_path: PathBuf,
    checkpoint: Checkpoint,
    fetch_workers: usize,
    persist_workers: usize,
    retry_backoff: Duration,
    poll_interval: Duration,
    request_timeout: Duration,
    metrics_interval: Duration,
}

pub struct IngestConfigParams {
    pub source_url: String,
    pub store_uri: String,
    pub store_database: String,
    pub blocks_collection: String,
    pub transactions_collection: String,
    pub log_path: PathBuf,
    pub checkpoint: Checkpoint,
    pub fetch_workers: usize,
    pub persist_workers: usize,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub metrics_interval: Duration,
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    pub fn new(params: IngestConfigParams) -> Result<Self> {
        let IngestConfigParams {
            source_url,
            store_uri,
            store_database,
            blocks_collection,
            transactions_collection,
            log_path,
            checkpoint,
            fetch_workers,
            persist_workers,
            retry_backoff,
            poll_interval,
            request_timeout,
            metrics_interval,
        } = params;

        let config = Self {
            source_url: trimmed_string(source_url),
            store_uri: trimmed_string(store_uri),
            store_database: trimmed_string(store_database),
            blocks_collection: trimmed_string(blocks_collection),
            transactions_collection: trimmed_string(transactions_collection),
            log_path,
            checkpoint,
            fetch_workers,
            persist_workers,
            retry_backoff,
            poll_interval,
            request_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Loads `.env` (if present) and reads `COSMOS_INGEST_*` variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env file");
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`IngestConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = EnvVars { lookup };

        let mut builder = Self::builder()
            .source_url(vars.string("SOURCE_URL").unwrap_or_else(|| DEFAULT_SOURCE_URL.into()));

        if let Some(uri) = vars.string("STORE_URI") {
            builder = builder.store_uri(uri);
        }
        if let Some(database) = vars.string("STORE_DATABASE") {
            builder = builder.store_database(database);
        }
        if let Some(collection) = vars.string("BLOCKS_COLLECTION") {
            builder = builder.blocks_collection(collection);
        }
        if let Some(collection) = vars.string("TRANSACTIONS_COLLECTION") {
            builder = builder.transactions_collection(collection);
        }
        if let Some(path) = vars.string("LOG_FILE") {
            builder = builder.log_path(path);
        }
        if let Some(checkpoint) = vars.parse::<i64>("LOG_CHECKPOINT")? {
            builder = builder.checkpoint(Checkpoint::from_signed(checkpoint));
        }
        if let Some(workers) = vars.parse("FETCH_WORKERS")? {
            builder = builder.fetch_workers(workers);
        }
        if let Some(workers) = vars.parse("PERSIST_WORKERS")? {
            builder = builder.persist_workers(workers);
        }
        if let Some(backoff) = vars.duration("RETRY_BACKOFF")? {
            builder = builder.retry_backoff(backoff);
        }
        if let Some(interval) = vars.duration("POLL_INTERVAL")? {
            builder = builder.poll_interval(interval);
        }
        if let Some(timeout) = vars.duration("REQUEST_TIMEOUT")? {
            builder = builder.request_timeout(timeout);
        }
        if let Some(interval) = vars.duration("METRICS_INTERVAL")? {
            builder = builder.metrics_interval(interval);
        }

        builder.build()
    }

    /// Base URL of the Cosmos REST (LCD) endpoint.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn store_uri(&self) -> &str {
        &self.store_uri
    }

    pub fn store_database(&self) -> &str {
        &self.store_database
    }

    pub fn blocks_collection(&self) -> &str {
        &self.blocks_collection
    }

    pub fn transactions_collection(&self) -> &str {
        &self.transactions_collection
    }

    /// Activity log location. Recovery dumps are written next to it.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn fetch_workers(&self) -> usize {
        self.fetch_workers
    }

    pub fn persist_workers(&self) -> usize {
        self.persist_workers
    }

    /// Fixed delay between retries of any transient failure.
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Delay between source head polls once caught up.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn validate(&self) -> Result<()> {
        validate_source_url(&self.source_url)?;
        validate_store_uri(&self.store_uri)?;
        ensure_not_empty(&self.store_database, "store_database")?;
        ensure_not_empty(&self.blocks_collection, "blocks_collection")?;
        ensure_not_empty(&self.transactions_collection, "transactions_collection")?;

        if self.blocks_collection == self.transactions_collection {
            bail!("blocks_collection and transactions_collection must differ");
        }

        if self.log_path.as_os_str().is_empty() {
            bail!("log_path cannot be empty");
        }

        if self.fetch_workers == 0 {
            bail!("fetch_workers must be greater than 0");
        }

        if self.persist_workers == 0 {
            bail!("persist_workers must be greater than 0");
        }

        if self.retry_backoff.is_zero() {
            bail!("retry_backoff must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IngestConfigBuilder {
    source_url: Option<String>,
    store_uri: Option<String>,
    store_database: Option<String>,
    blocks_collection: Option<String>,
    transactions_collection: Option<String>,
    log_path: Option<PathBuf>,
    checkpoint: Option<Checkpoint>,
    fetch_workers: Option<usize>,
    persist_workers: Option<usize>,
    retry_backoff: Option<Duration>,
    poll_interval: Option<Duration>,
    request_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl IngestConfigBuilder {
    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn store_uri(mut self, uri: impl Into<String>) -> Self {
        self.store_uri = Some(uri.into());
        self
    }

    pub fn store_database(mut self, database: impl Into<String>) -> Self {
        self.store_database = Some(database.into());
        self
    }

    pub fn blocks_collection(mut self, collection: impl Into<String>) -> Self {
        self.blocks_collection = Some(collection.into());
        self
    }

    pub fn transactions_collection(mut self, collection: impl Into<String>) -> Self {
        self.transactions_collection = Some(collection.into());
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Sets both pool sizes at once.
    pub fn workers(self, count: usize) -> Self {
        self.fetch_workers(count).persist_workers(count)
    }

    pub fn fetch_workers(mut self, count: usize) -> Self {
        self.fetch_workers = Some(count);
        self
    }

    pub fn persist_workers(mut self, count: usize) -> Self {
        self.persist_workers = Some(count);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<IngestConfig> {
        let params = IngestConfigParams {
            source_url: self.source_url.context("source_url is required")?,
            store_uri: self.store_uri.unwrap_or_else(|| DEFAULT_STORE_URI.into()),
            store_database: self
                .store_database
                .unwrap_or_else(|| DEFAULT_STORE_DATABASE.into()),
            blocks_collection: self
                .blocks_collection
                .unwrap_or_else(|| DEFAULT_BLOCKS_COLLECTION.into()),
            transactions_collection: self
                .transactions_collection
                .unwrap_or_else(|| DEFAULT_TRANSACTIONS_COLLECTION.into()),
            log_path: self
                .log_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            checkpoint: self.checkpoint.unwrap_or(Checkpoint::at(0)),
            fetch_workers: self.fetch_workers.unwrap_or(DEFAULT_WORKERS),
            persist_workers: self.persist_workers.unwrap_or(DEFAULT_WORKERS),
            retry_backoff: self
                .retry_backoff
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS)),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)),
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        IngestConfig::new(params)
    }
}

struct EnvVars<F> {
    lookup: F,
}

impl<F> EnvVars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, suffix: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(suffix)
            .map(|value| {
                value
                    .parse()
                    .map_err(|err| anyhow::anyhow!("{ENV_PREFIX}{suffix}={value:?}: {err}"))
            })
            .transpose()
    }

    fn duration(&self, suffix: &str) -> Result<Option<Duration>> {
        self.string(suffix)
            .map(|value| {
                humantime::parse_duration(&value)
                    .with_context(|| format!("{ENV_PREFIX}{suffix}={value:?} is not a duration"))
            })
            .transpose()
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_source_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("source_url must start with http:// or https://");
    }
    Ok(())
}

fn validate_store_uri(uri: &str) -> Result<()> {
    if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
        bail!("store_uri must start with mongodb:// or mongodb+srv://");
    }
    Ok(())
}
