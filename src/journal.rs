//! Append-only activity log: the record of every fetch and persist outcome,
//! plus the recovery pass that derives a safe resume height from it.

pub mod file;
pub mod memory;
pub mod record;
pub mod recovery;

use anyhow::Result;

pub use file::FileActivityLog;
pub use memory::MemoryActivityLog;
pub use record::{LogRecord, Stream};
pub use recovery::{Checkpoint, RecoveryError, RecoveryOutcome, RecoveryValidator};

/// Durable, ordered sink for [`LogRecord`]s.
///
/// Appends from concurrent workers must be serialised so that each record is
/// either fully present or absent. `read_all` is only called once at startup,
/// before any worker runs.
pub trait ActivityLog: Send + Sync {
    fn append(&self, record: &LogRecord) -> Result<()>;

    fn read_all(&self) -> Result<Vec<LogRecord>>;
}
