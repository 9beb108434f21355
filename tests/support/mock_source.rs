use std::{
    collections::HashSet,
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const BLOCKS_PREFIX: &str = "/cosmos/base/tendermint/v1beta1/blocks/";
const TXS_PATH: &str = "/cosmos/tx/v1beta1/txs";

/// A chain as seen through the Cosmos REST gateway.
#[derive(Clone)]
pub struct MockChain {
    head: Arc<AtomicU64>,
    empty: Arc<Mutex<HashSet<u64>>>,
    unavailable: Arc<Mutex<HashSet<u64>>>,
    refused_transaction_queries: Arc<AtomicUsize>,
    path_prefix: Arc<Mutex<String>>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRequest {
    Latest,
    Block(u64),
    Transactions(u64),
}

impl MockRequest {
    pub fn height(&self) -> Option<u64> {
        match self {
            MockRequest::Latest => None,
            MockRequest::Block(height) | MockRequest::Transactions(height) => Some(*height),
        }
    }
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        Self {
            head: Arc::new(AtomicU64::new(head)),
            empty: Arc::new(Mutex::new(HashSet::new())),
            unavailable: Arc::new(Mutex::new(HashSet::new())),
            refused_transaction_queries: Arc::new(AtomicUsize::new(0)),
            path_prefix: Arc::new(Mutex::new(String::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Heights whose transaction search reports `total: "0"`.
    pub fn with_empty_transactions(self, heights: impl IntoIterator<Item = u64>) -> Self {
        self.empty
            .lock()
            .expect("mock chain poisoned")
            .extend(heights);
        self
    }

    /// Heights the node answers with "height N is not available".
    pub fn with_unavailable(self, heights: impl IntoIterator<Item = u64>) -> Self {
        self.unavailable
            .lock()
            .expect("mock chain poisoned")
            .extend(heights);
        self
    }

    /// The next `count` transaction queries are answered with a 400 that
    /// carries no height marker, the way a node with indexing disabled does.
    pub fn with_refused_transaction_queries(self, count: usize) -> Self {
        self.refused_transaction_queries.store(count, Ordering::SeqCst);
        self
    }

    /// Serves the gateway under `prefix`, as a reverse proxy would.
    pub fn with_path_prefix(self, prefix: &str) -> Self {
        *self.path_prefix.lock().expect("mock chain poisoned") = prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().expect("mock chain poisoned").clone()
    }

    pub fn requested_heights(&self) -> Vec<u64> {
        self.requests()
            .iter()
            .filter_map(MockRequest::height)
            .collect()
    }

    fn record(&self, request: MockRequest) {
        self.requests
            .lock()
            .expect("mock chain poisoned")
            .push(request);
    }

    fn is_unavailable(&self, height: u64) -> bool {
        self.unavailable
            .lock()
            .expect("mock chain poisoned")
            .contains(&height)
    }

    fn refuse_transaction_query(&self) -> bool {
        self.refused_transaction_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn route<'p>(&self, path: &'p str) -> Option<&'p str> {
        let prefix = self.path_prefix.lock().expect("mock chain poisoned");
        path.strip_prefix(prefix.as_str())
    }

    fn is_empty(&self, height: u64) -> bool {
        self.empty
            .lock()
            .expect("mock chain poisoned")
            .contains(&height)
    }
}

pub fn block_document(height: u64) -> Value {
    json!({
        "block_id": { "hash": format!("HASH{height:08}") },
        "block": {
            "header": {
                "chain_id": "mock-1",
                "height": height.to_string(),
            },
            "data": { "txs": [] },
        },
    })
}

fn transactions_document(height: u64) -> Value {
    json!({
        "txs": [{ "body": { "memo": format!("tx at {height}") } }],
        "tx_responses": [{ "height": height.to_string(), "txhash": format!("TX{height:08}") }],
        "pagination": { "next_key": null, "total": "1" },
    })
}

fn empty_transactions_document() -> Value {
    json!({
        "txs": [],
        "tx_responses": [],
        "pagination": { "next_key": null, "total": "0" },
    })
}

pub struct MockSourceServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockSourceServer {
    pub async fn start(chain: MockChain) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock source listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let chain = chain.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(chain.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock source server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(chain: MockChain, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::GET {
        return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, json!({ "message": "GET only" })));
    }

    let Some(path) = chain.route(req.uri().path()) else {
        return Ok(respond(StatusCode::NOT_FOUND, json!({ "code": 5, "message": "Not Found" })));
    };
    if let Some(rest) = path.strip_prefix(BLOCKS_PREFIX) {
        if rest == "latest" {
            chain.record(MockRequest::Latest);
            let head = chain.head();
            return Ok(respond(
                StatusCode::OK,
                json!({ "block": { "header": { "height": head.to_string() } } }),
            ));
        }
        return Ok(match rest.parse::<u64>() {
            Ok(height) => {
                chain.record(MockRequest::Block(height));
                serve_block(&chain, height)
            }
            Err(_) => respond(StatusCode::BAD_REQUEST, json!({ "code": 3, "message": "invalid height" })),
        });
    }

    if path == TXS_PATH {
        return Ok(match query_height(req.uri().query().unwrap_or_default()) {
            Some(height) => {
                chain.record(MockRequest::Transactions(height));
                serve_transactions(&chain, height)
            }
            None => respond(StatusCode::BAD_REQUEST, json!({ "code": 3, "message": "missing events" })),
        });
    }

    Ok(respond(StatusCode::NOT_FOUND, json!({ "code": 5, "message": "Not Implemented" })))
}

fn serve_block(chain: &MockChain, height: u64) -> Response<Body> {
    if chain.is_unavailable(height) {
        return unavailable(height);
    }
    if height > chain.head() {
        return respond(
            StatusCode::BAD_REQUEST,
            json!({ "code": 3, "message": "requested block height is bigger then the chain length" }),
        );
    }
    respond(StatusCode::OK, block_document(height))
}

fn serve_transactions(chain: &MockChain, height: u64) -> Response<Body> {
    if chain.is_unavailable(height) {
        return unavailable(height);
    }
    if chain.refuse_transaction_query() {
        return respond(
            StatusCode::BAD_REQUEST,
            json!({ "code": 2, "message": "transaction indexing is disabled" }),
        );
    }
    if chain.is_empty(height) {
        return respond(StatusCode::OK, empty_transactions_document());
    }
    respond(StatusCode::OK, transactions_document(height))
}

fn unavailable(height: u64) -> Response<Body> {
    respond(
        StatusCode::BAD_REQUEST,
        json!({
            "code": 3,
            "message": format!("height {height} is not available, lowest height is 1000"),
        }),
    )
}

/// Extracts `N` from `events=tx.height=N`, tolerating a percent-encoded `=`.
fn query_height(query: &str) -> Option<u64> {
    query.split('&').find_map(|pair| {
        let value = pair.strip_prefix("events=")?;
        let value = value.replace("%3D", "=").replace("%3d", "=");
        value.strip_prefix("tx.height=")?.parse().ok()
    })
}

fn respond(status: StatusCode, body: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
