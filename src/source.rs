//! Block source plumbing: the `BlockSource` seam consumed by fetch workers,
//! its error taxonomy, and the Cosmos REST client behind it.

pub mod client;
pub mod metrics;
pub mod options;

pub use client::{BlockSource, RestSourceClient, SourceError};
pub use metrics::SourceMetricsSnapshot;
pub use options::SourceClientOptions;
