//! Startup consistency check over the activity log.
//!
//! Workers complete out of height order, so after an unclean stop the log may
//! hold a block record without the matching transactions record (or the other
//! way around). The validator rebuilds the per-stream height sets, checks
//! that everything above the checkpoint is contiguous and that both streams
//! agree on their last height, and otherwise refuses to start after dumping
//! the sets for an operator.

use super::{LogRecord, Stream};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Operator-supplied height at or below which the log is trusted as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint(Option<u64>);

impl Checkpoint {
    /// No checkpoint: ordering is never validated.
    pub const NONE: Checkpoint = Checkpoint(None);

    pub fn at(height: u64) -> Self {
        Self(Some(height))
    }

    /// Negative values disable validation.
    pub fn from_signed(value: i64) -> Self {
        u64::try_from(value).map_or(Self::NONE, Self::at)
    }

    pub fn height(&self) -> Option<u64> {
        self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(height) => write!(f, "{height}"),
            None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Both streams are consistent up to and including this height.
    Resume(u64),
    /// The streams disagree, but only at or below the checkpoint.
    CheckpointCovers,
}

#[derive(Debug)]
pub enum RecoveryError {
    MalformedRecord {
        /// 1-based position among the records returned by the log.
        record: usize,
        stream: Stream,
        value: String,
    },
    OutOfOrder {
        stream: Stream,
        checkpoint: u64,
        got: u64,
        want: u64,
        dump: PathBuf,
    },
    CrashDetected {
        last_blocks: u64,
        last_transactions: u64,
        dumps: Vec<PathBuf>,
    },
    Dump {
        path: PathBuf,
        source: io::Error,
    },
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::MalformedRecord {
                record,
                stream,
                value,
            } => write!(
                f,
                "activity log record #{record} on the {stream} stream has a malformed height {value:?}"
            ),
            RecoveryError::OutOfOrder {
                stream,
                checkpoint,
                got,
                want,
                dump,
            } => write!(
                f,
                "{stream} out of order after checkpoint {checkpoint} (got {got}, want {want}); \
                 manual recovery needed, see {}",
                dump.display()
            ),
            RecoveryError::CrashDetected {
                last_blocks,
                last_transactions,
                dumps,
            } => {
                write!(
                    f,
                    "crash detected: last block {last_blocks} != last transactions {last_transactions}; \
                     manual recovery needed"
                )?;
                let listed: Vec<String> = dumps
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                if !listed.is_empty() {
                    write!(f, ", see {}", listed.join(" and "))?;
                }
                Ok(())
            }
            RecoveryError::Dump { path, source } => {
                write!(f, "failed to write recovery dump {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecoveryError::Dump { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryValidator {
    checkpoint: Checkpoint,
    dump_base: PathBuf,
}

impl RecoveryValidator {
    /// `dump_base` is normally the activity log path; dumps land next to it as
    /// `<base>.bxs-dump` and `<base>.txs-dump`.
    pub fn new(checkpoint: Checkpoint, dump_base: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint,
            dump_base: dump_base.into(),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn dump_path(&self, stream: Stream) -> PathBuf {
        let mut path = self.dump_base.clone().into_os_string();
        path.push(format!(".{}-dump", stream.tag()));
        PathBuf::from(path)
    }

    pub fn validate(&self, records: &[LogRecord]) -> Result<RecoveryOutcome, RecoveryError> {
        let heights = StreamHeights::collect(records)?;

        self.check_contiguous(Stream::Blocks, &heights.blocks)?;
        self.check_contiguous(Stream::Transactions, &heights.transactions)?;

        let last_blocks = heights.blocks.last().copied().unwrap_or(0);
        let last_transactions = heights.transactions.last().copied().unwrap_or(0);

        if last_blocks == last_transactions {
            tracing::info!(
                resume = last_blocks,
                checkpoint = %self.checkpoint,
                "activity log is consistent"
            );
            return Ok(RecoveryOutcome::Resume(last_blocks));
        }

        if let Some(checkpoint) = self.checkpoint.height() {
            if checkpoint >= last_blocks.max(last_transactions) {
                tracing::info!(
                    checkpoint,
                    last_blocks,
                    last_transactions,
                    "stream mismatch is covered by the checkpoint"
                );
                return Ok(RecoveryOutcome::CheckpointCovers);
            }
        }

        let mut dumps = Vec::new();
        for (stream, set) in [
            (Stream::Blocks, &heights.blocks),
            (Stream::Transactions, &heights.transactions),
        ] {
            if let Some(path) = self.dump(stream, set)? {
                dumps.push(path);
            }
        }

        Err(RecoveryError::CrashDetected {
            last_blocks,
            last_transactions,
            dumps,
        })
    }

    fn check_contiguous(&self, stream: Stream, heights: &BTreeSet<u64>) -> Result<(), RecoveryError> {
        let Some(checkpoint) = self.checkpoint.height() else {
            return Ok(());
        };
        let Some(&last) = heights.last() else {
            return Ok(());
        };
        if checkpoint >= last {
            return Ok(());
        }

        let mut want = checkpoint.saturating_add(1);
        for &got in heights.range(want..) {
            if got != want {
                let dump = self
                    .dump(stream, heights)?
                    .unwrap_or_else(|| self.dump_path(stream));
                return Err(RecoveryError::OutOfOrder {
                    stream,
                    checkpoint,
                    got,
                    want,
                    dump,
                });
            }
            want += 1;
        }

        Ok(())
    }

    fn dump(&self, stream: Stream, heights: &BTreeSet<u64>) -> Result<Option<PathBuf>, RecoveryError> {
        if heights.is_empty() {
            return Ok(None);
        }
        let path = self.dump_path(stream);
        write_descending(&path, heights).map_err(|source| RecoveryError::Dump {
            path: path.clone(),
            source,
        })?;
        tracing::warn!(stream = %stream, path = %path.display(), "wrote recovery dump");
        Ok(Some(path))
    }
}

fn write_descending(path: &Path, heights: &BTreeSet<u64>) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for height in heights.iter().rev() {
        writeln!(writer, "{height}")?;
    }
    writer.flush()
}

#[derive(Default)]
struct StreamHeights {
    blocks: BTreeSet<u64>,
    transactions: BTreeSet<u64>,
}

impl StreamHeights {
    fn collect(records: &[LogRecord]) -> Result<Self, RecoveryError> {
        let mut heights = Self::default();
        for (index, record) in records.iter().enumerate() {
            match record.stream {
                Stream::Blocks => {
                    heights.blocks.insert(subject_height(index, record)?);
                }
                Stream::Transactions => {
                    heights.transactions.insert(subject_height(index, record)?);
                }
                Stream::Other if record.is_invalid_marker() => {
                    let height = subject_height(index, record)?;
                    heights.blocks.insert(height);
                    heights.transactions.insert(height);
                }
                Stream::Other => {}
            }
        }
        Ok(heights)
    }
}

fn subject_height(index: usize, record: &LogRecord) -> Result<u64, RecoveryError> {
    let value = record.subject().unwrap_or_default();
    value
        .trim()
        .parse()
        .map_err(|_| RecoveryError::MalformedRecord {
            record: index + 1,
            stream: record.stream,
            value: value.to_string(),
        })
}
