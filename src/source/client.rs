//! Cosmos LCD REST client and the `BlockSource` abstraction consumed by fetch
//! workers.

use crate::runtime::config::IngestConfig;
use crate::source::metrics::{RequestOutcome, SourceMetrics, SourceMetricsSnapshot};
use crate::source::options::SourceClientOptions;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

// Relative, so they resolve under any path prefix of the configured url.
const BLOCKS_PATH: &str = "cosmos/base/tendermint/v1beta1/blocks";
const TXS_PATH: &str = "cosmos/tx/v1beta1/txs";
const ERROR_BODY_LIMIT: usize = 512;

/// The LCD routes the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Latest,
    Block(u64),
    Transactions(u64),
}

impl Endpoint {
    fn path(self) -> String {
        match self {
            Endpoint::Latest => format!("{BLOCKS_PATH}/latest"),
            Endpoint::Block(height) => format!("{BLOCKS_PATH}/{height}"),
            Endpoint::Transactions(_) => TXS_PATH.to_string(),
        }
    }

    fn query(self) -> Vec<(&'static str, String)> {
        match self {
            Endpoint::Transactions(height) => vec![("events", format!("tx.height={height}"))],
            _ => Vec::new(),
        }
    }

    fn height(self) -> Option<u64> {
        match self {
            Endpoint::Latest => None,
            Endpoint::Block(height) | Endpoint::Transactions(height) => Some(height),
        }
    }
}

#[derive(Debug)]
pub enum SourceError {
    /// The node answered that it does not serve this height (pruned or not
    /// yet indexed). The height is skipped.
    HeightUnavailable { height: u64, message: String },
    /// The node refused the request outright.
    Rejected { status: u16, body: String },
    /// The node answered, but not with something we can decode.
    Malformed { context: String },
    /// Connection, timeout, or server-side failure. Retried.
    Transport(anyhow::Error),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transport(_))
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::HeightUnavailable { height, message } => {
                write!(f, "height {height} is unavailable at the source: {message}")
            }
            SourceError::Rejected { status, body } => {
                write!(f, "source rejected the request with status {status}: {body}")
            }
            SourceError::Malformed { context } => {
                write!(f, "malformed source response: {context}")
            }
            SourceError::Transport(err) => write!(f, "source transport error: {err:#}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SourceError::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Read-only view of a chain, addressed by height.
pub trait BlockSource: Send + Sync {
    fn current_height(&self) -> BoxFuture<'_, Result<u64, SourceError>>;

    fn block_at(&self, height: u64) -> BoxFuture<'_, Result<Bytes, SourceError>>;

    /// `None` when the height carries no transactions.
    fn transactions_at(&self, height: u64) -> BoxFuture<'_, Result<Option<Bytes>, SourceError>>;
}

#[derive(Debug, Clone)]
pub struct RestSourceClient {
    base_url: Arc<Url>,
    client: reqwest::Client,
    options: SourceClientOptions,
    metrics: Arc<SourceMetrics>,
}

impl BlockSource for RestSourceClient {
    fn current_height(&self) -> BoxFuture<'_, Result<u64, SourceError>> {
        Box::pin(self.current_height())
    }

    fn block_at(&self, height: u64) -> BoxFuture<'_, Result<Bytes, SourceError>> {
        Box::pin(self.block_at(height))
    }

    fn transactions_at(&self, height: u64) -> BoxFuture<'_, Result<Option<Bytes>, SourceError>> {
        Box::pin(self.transactions_at(height))
    }
}

impl RestSourceClient {
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        Self::with_options(url, SourceClientOptions::default())
    }

    pub fn with_options(url: impl AsRef<str>, options: SourceClientOptions) -> Result<Self> {
        options.validate()?;

        let url = url.as_ref().trim();
        let mut base_url =
            Url::parse(url).with_context(|| format!("invalid source url {url:?}"))?;
        if base_url.cannot_be_a_base() {
            bail!("source url {url:?} cannot carry request paths");
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(options.connect_timeout)
            .pool_max_idle_per_host(options.max_idle_per_host)
            .user_agent(concat!("cosmos-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| anyhow!("failed to build source client: {err}"))?;

        Ok(Self {
            base_url: Arc::new(base_url),
            client,
            options,
            metrics: Arc::new(SourceMetrics::default()),
        })
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let options = SourceClientOptions {
            request_timeout: config.request_timeout(),
            max_idle_per_host: config.fetch_workers().max(1),
            ..SourceClientOptions::default()
        };
        Self::with_options(config.source_url(), options)
    }

    pub fn endpoint(&self) -> &str {
        self.base_url.as_str()
    }

    pub fn options(&self) -> &SourceClientOptions {
        &self.options
    }

    pub fn metrics(&self) -> SourceMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn current_height(&self) -> Result<u64, SourceError> {
        let body = self.get(Endpoint::Latest).await?;
        parse_latest_height(&body)
    }

    pub async fn block_at(&self, height: u64) -> Result<Bytes, SourceError> {
        self.get(Endpoint::Block(height)).await
    }

    pub async fn transactions_at(&self, height: u64) -> Result<Option<Bytes>, SourceError> {
        // TODO: follow `pagination.next_key` for heights whose transactions do
        // not fit the node's default page size.
        let body = self.get(Endpoint::Transactions(height)).await?;
        transactions_payload(body)
    }

    fn request_url(&self, endpoint: Endpoint) -> Result<Url, SourceError> {
        let path = endpoint.path();
        self.base_url
            .join(&path)
            .map_err(|err| SourceError::Malformed {
                context: format!("cannot build request url for {path}: {err}"),
            })
    }

    async fn get(&self, endpoint: Endpoint) -> Result<Bytes, SourceError> {
        let url = self.request_url(endpoint)?;
        let path = url.path().to_string();

        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .query(&endpoint.query())
            .header(ACCEPT, "application/json")
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let outcome = if err.is_timeout() {
                    RequestOutcome::TimedOut
                } else {
                    RequestOutcome::Failed
                };
                self.metrics.record(outcome, started.elapsed());
                return Err(SourceError::Transport(
                    anyhow::Error::new(err).context(format!("GET {path} failed")),
                ));
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                self.metrics.record(RequestOutcome::Failed, started.elapsed());
                return Err(SourceError::Transport(
                    anyhow::Error::new(err).context(format!("failed to read body of GET {path}")),
                ));
            }
        };

        if status.is_success() {
            self.metrics.record(RequestOutcome::Answered, started.elapsed());
            return Ok(body);
        }

        let err = classify_failure(endpoint, status, &body);
        let outcome = match err {
            SourceError::HeightUnavailable { .. } => RequestOutcome::Unavailable,
            _ => RequestOutcome::Failed,
        };
        self.metrics.record(outcome, started.elapsed());
        Err(err)
    }
}

/// Only a 400 carrying the unavailable-height marker, or a 400 from a block
/// route, is final. The transactions route answers 400 for conditions a node
/// can recover from (indexing disabled or lagging), so those are retried.
pub(crate) fn classify_failure(endpoint: Endpoint, status: StatusCode, body: &[u8]) -> SourceError {
    let text = String::from_utf8_lossy(body);
    let text = truncate(text.trim(), ERROR_BODY_LIMIT);

    if status != StatusCode::BAD_REQUEST {
        return SourceError::Transport(anyhow!("source answered {status}: {text}"));
    }

    if let Some(height) = endpoint.height() {
        let marker = format!("height {height} is not available");
        if text.contains(&marker) {
            return SourceError::HeightUnavailable {
                height,
                message: marker,
            };
        }
    }

    if let Endpoint::Transactions(_) = endpoint {
        return SourceError::Transport(anyhow!("transactions query answered {status}: {text}"));
    }

    SourceError::Rejected {
        status: status.as_u16(),
        body: text.to_string(),
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[derive(Deserialize)]
struct LatestBlock {
    block: LatestBlockBody,
}

#[derive(Deserialize)]
struct LatestBlockBody {
    header: LatestHeader,
}

#[derive(Deserialize)]
struct LatestHeader {
    height: String,
}

fn parse_latest_height(body: &[u8]) -> Result<u64, SourceError> {
    let latest: LatestBlock =
        serde_json::from_slice(body).map_err(|err| SourceError::Malformed {
            context: format!("latest block: {err}"),
        })?;
    let height = latest.block.header.height.trim();
    height.parse().map_err(|_| SourceError::Malformed {
        context: format!("latest block height {height:?} is not a number"),
    })
}

#[derive(Deserialize)]
struct TxsPage {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default)]
    total: Option<String>,
}

fn transactions_payload(body: Bytes) -> Result<Option<Bytes>, SourceError> {
    let page: TxsPage = serde_json::from_slice(&body).map_err(|err| SourceError::Malformed {
        context: format!("transactions page: {err}"),
    })?;

    let total = page.pagination.and_then(|pagination| pagination.total);
    if total.as_deref().map(str::trim) == Some("0") {
        return Ok(None);
    }
    Ok(Some(body))
}
