//! Document store seam used by persist workers, with a MongoDB backend and an
//! in-memory backend.

pub mod memory;
pub mod mongo;

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

#[derive(Debug)]
pub enum StoreError {
    /// The store refused the document itself. Retrying cannot help.
    Rejected(anyhow::Error),
    /// The store could not be reached or did not acknowledge the write.
    Unavailable(anyhow::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Rejected(err) => write!(f, "store rejected document: {err:#}"),
            StoreError::Unavailable(err) => write!(f, "store unavailable: {err:#}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait DocumentStore: Send + Sync {
    /// Inserts `document` into the named collection and returns the id the
    /// store assigned to it.
    fn insert<'a>(
        &'a self,
        destination: &'a str,
        document: &'a Value,
    ) -> BoxFuture<'a, Result<String, StoreError>>;
}
