//! The ingestion pipeline: gap computation, the fetch and persist pools, and
//! the orchestrator that connects them.

pub mod backoff;
pub mod fetch_pool;
pub mod gap;
pub mod lifecycle;
pub mod persist_pool;
pub mod pipeline;
pub mod tip;
pub mod types;
pub mod worker_pool;
