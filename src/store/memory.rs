use super::{DocumentStore, StoreError};
use anyhow::anyhow;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Document store kept in process memory.
///
/// `fail_next` makes the following inserts report [`StoreError::Unavailable`],
/// which lets callers exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<(String, Value)>>>,
    next_id: AtomicU64,
    pending_failures: AtomicUsize,
    attempts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Documents stored in `destination`, in insertion order.
    pub fn documents(&self, destination: &str) -> Vec<Value> {
        self.collections
            .lock()
            .map(|collections| {
                collections
                    .get(destination)
                    .map(|docs| docs.iter().map(|(_, doc)| doc.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, destination: &str) -> usize {
        self.collections
            .lock()
            .map(|collections| collections.get(destination).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.collections
            .lock()
            .map(|collections| collections.values().all(Vec::is_empty))
            .unwrap_or(true)
    }

    /// Total insert calls seen, failed ones included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok()
    }
}

impl DocumentStore for MemoryStore {
    fn insert<'a>(
        &'a self,
        destination: &'a str,
        document: &'a Value,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if self.take_failure() {
                return Err(StoreError::Unavailable(anyhow!("injected store failure")));
            }
            if !document.is_object() {
                return Err(StoreError::Rejected(anyhow!(
                    "documents must be JSON objects"
                )));
            }

            let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.collections
                .lock()
                .map_err(|_| StoreError::Unavailable(anyhow!("memory store poisoned")))?
                .entry(destination.to_string())
                .or_default()
                .push((id.clone(), document.clone()));
            Ok(id)
        })
    }
}
