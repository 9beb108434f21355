use super::{ActivityLog, LogRecord, Stream};
use anyhow::{anyhow, Result};
use std::sync::Mutex;

/// In-process activity log, mostly useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<LogRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records currently held on `stream`, in append order.
    pub fn stream(&self, stream: Stream) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.stream == stream)
            .collect()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn append(&self, record: &LogRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow!("memory activity log poisoned"))?
            .push(record.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>> {
        Ok(self.records())
    }
}
