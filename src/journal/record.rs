use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Status token marking a height that was skipped on both streams.
pub const INVALID_STATUS: &str = "invalid";
/// Status token marking a height whose transaction list was empty.
pub const EMPTY_STATUS: &str = "empty";
const STORED_MARKER: &str = "->";

/// Logical stream a [`LogRecord`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Blocks,
    Transactions,
    Other,
}

impl Stream {
    /// Short tag used in dump file extensions and log fields.
    pub fn tag(self) -> &'static str {
        match self {
            Stream::Blocks => "bxs",
            Stream::Transactions => "txs",
            Stream::Other => "std",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::Blocks => "blocks",
            Stream::Transactions => "transactions",
            Stream::Other => "other",
        };
        f.write_str(name)
    }
}

/// One immutable entry of the activity log.
///
/// For the `Blocks` and `Transactions` streams `fields[0]` is always the
/// subject height. `Other` records carry either a skip marker
/// (`[height, "invalid", reason]`) or free-form lifecycle notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub stream: Stream,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub fields: Vec<String>,
}

impl LogRecord {
    pub fn new(stream: Stream, fields: Vec<String>) -> Self {
        Self {
            stream,
            timestamp: OffsetDateTime::now_utc(),
            fields,
        }
    }

    /// `height -> id` on the given stream, written after a successful insert.
    pub fn stored(stream: Stream, height: u64, id: &str) -> Self {
        Self::new(
            stream,
            vec![height.to_string(), STORED_MARKER.to_string(), id.to_string()],
        )
    }

    pub fn empty_transactions(height: u64) -> Self {
        Self::new(
            Stream::Transactions,
            vec![height.to_string(), EMPTY_STATUS.to_string()],
        )
    }

    /// Marks `height` as deliberately skipped for both streams.
    pub fn invalid(height: u64, reason: impl Into<String>) -> Self {
        Self::new(
            Stream::Other,
            vec![height.to_string(), INVALID_STATUS.to_string(), reason.into()],
        )
    }

    pub fn note<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Stream::Other, fields.into_iter().map(Into::into).collect())
    }

    pub fn is_invalid_marker(&self) -> bool {
        self.stream == Stream::Other
            && self.fields.get(1).map(String::as_str) == Some(INVALID_STATUS)
    }

    /// The raw subject field, if any.
    pub fn subject(&self) -> Option<&str> {
        self.fields.first().map(String::as_str)
    }
}
