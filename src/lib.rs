pub mod journal;
pub mod processor;
pub mod runtime;
pub mod source;
pub mod store;

/// Crate version, written to the activity log on every start.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use journal::{
    ActivityLog, Checkpoint, FileActivityLog, LogRecord, MemoryActivityLog, RecoveryError,
    RecoveryOutcome, RecoveryValidator, Stream,
};
pub use processor::gap::{Gap, GapError};
pub use processor::pipeline::{Pipeline, PipelineReport, PipelineState};
pub use processor::tip::SourceHead;
pub use runtime::config::{IngestConfig, IngestConfigBuilder, IngestConfigParams};
pub use runtime::runner::{Runner, ShutdownController, ShutdownRequest};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use source::{BlockSource, RestSourceClient, SourceError};
pub use store::{DocumentStore, MemoryStore, MongoStore, StoreError};
