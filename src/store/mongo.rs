use super::{DocumentStore, StoreError};
use crate::processor::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition, RetryError};
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::{Client, Database};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    /// Connects and pings the deployment, retrying every `backoff` until it
    /// answers or `shutdown` fires.
    pub async fn connect(
        uri: &str,
        database: &str,
        backoff: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let outcome = retry_with_backoff(
            RetryBackoff::fixed(backoff).with_cancellation(shutdown),
            |_| Self::try_connect(uri, database),
            |attempt, delay, err: &anyhow::Error| {
                tracing::warn!(
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "store connection failed; retrying"
                );
            },
            |_, _| RetryDisposition::Retry,
        )
        .await;

        match outcome {
            Ok(store) => {
                tracing::info!(database, "connected to document store");
                Ok(store)
            }
            Err(RetryError::Cancelled) => Err(anyhow!("store connection cancelled")),
            Err(RetryError::Aborted(err)) => Err(err),
        }
    }

    async fn try_connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .context("failed to parse store uri")?;
        let database = client.database(database);
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .context("store did not answer ping")?;
        Ok(Self { client, database })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }
}

impl DocumentStore for MongoStore {
    fn insert<'a>(
        &'a self,
        destination: &'a str,
        document: &'a Value,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let document = to_document(document)?;
            let result = self
                .database
                .collection::<Document>(destination)
                .insert_one(document, None)
                .await
                .map_err(insert_failure)?;
            Ok(render_id(&result.inserted_id))
        })
    }
}

fn to_document(value: &Value) -> Result<Document, StoreError> {
    bson::to_document(value)
        .map_err(|err| StoreError::Rejected(anyhow::Error::new(err).context("payload is not a document")))
}

/// A write error means the server refused this document, for example for
/// exceeding the BSON size limit, and every retry would fail the same way.
/// Anything else, write concern timeouts included, counts as the deployment
/// being unreachable.
fn insert_failure(err: MongoError) -> StoreError {
    if rejects_document(&err.kind) {
        StoreError::Rejected(anyhow::Error::new(err).context("insert refused"))
    } else {
        StoreError::Unavailable(err.into())
    }
}

fn rejects_document(kind: &ErrorKind) -> bool {
    matches!(kind, ErrorKind::Write(WriteFailure::WriteError(_)))
}

fn render_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(value) => value.clone(),
        other => other.to_string(),
    }
}
