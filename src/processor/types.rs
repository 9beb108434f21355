//! Messages that flow through the two pipeline queues.

use crate::journal::Stream;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub height: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistKind {
    Block,
    Transactions,
}

impl PersistKind {
    pub fn stream(self) -> Stream {
        match self {
            PersistKind::Block => Stream::Blocks,
            PersistKind::Transactions => Stream::Transactions,
        }
    }
}

impl fmt::Display for PersistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistKind::Block => f.write_str("block"),
            PersistKind::Transactions => f.write_str("transactions"),
        }
    }
}

/// One document waiting to be written, together with where it goes.
#[derive(Debug, Clone)]
pub struct PersistUnit {
    pub height: u64,
    pub kind: PersistKind,
    pub payload: Bytes,
    pub destination: Arc<str>,
}

/// Collection names for each kind of unit.
#[derive(Debug, Clone)]
pub struct Destinations {
    pub blocks: Arc<str>,
    pub transactions: Arc<str>,
}

impl Destinations {
    pub fn new(blocks: impl Into<Arc<str>>, transactions: impl Into<Arc<str>>) -> Self {
        Self {
            blocks: blocks.into(),
            transactions: transactions.into(),
        }
    }

    pub fn unit(&self, height: u64, kind: PersistKind, payload: Bytes) -> PersistUnit {
        let destination = match kind {
            PersistKind::Block => self.blocks.clone(),
            PersistKind::Transactions => self.transactions.clone(),
        };
        PersistUnit {
            height,
            kind,
            payload,
            destination,
        }
    }
}
