use crate::journal::{Checkpoint, RecoveryOutcome};
use std::fmt;

/// Inclusive range of heights still to ingest.
///
/// `tail` is the next height to enqueue; the range is exhausted once
/// `tail > head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub tail: u64,
    pub head: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapError {
    /// Stored state claims heights the source has not produced.
    AheadOfSource { resume: u64, head: u64 },
}

impl fmt::Display for GapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapError::AheadOfSource { resume, head } => write!(
                f,
                "resume height {resume} is ahead of the source height {head}"
            ),
        }
    }
}

impl std::error::Error for GapError {}

impl Gap {
    pub fn compute(
        outcome: RecoveryOutcome,
        checkpoint: Checkpoint,
        head: u64,
    ) -> Result<Self, GapError> {
        let resume = resume_height(outcome, checkpoint);
        if resume > head {
            return Err(GapError::AheadOfSource { resume, head });
        }
        Ok(Self {
            tail: resume + 1,
            head,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tail > self.head
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.head - self.tail + 1
        }
    }
}

fn resume_height(outcome: RecoveryOutcome, checkpoint: Checkpoint) -> u64 {
    let checkpoint = checkpoint.height();
    match outcome {
        RecoveryOutcome::Resume(logged) => match checkpoint {
            Some(checkpoint) if checkpoint > logged => {
                if logged > 0 {
                    tracing::warn!(
                        logged,
                        checkpoint,
                        "checkpoint is above the last logged height; heights in between are not re-ingested"
                    );
                }
                checkpoint
            }
            _ => logged,
        },
        RecoveryOutcome::CheckpointCovers => checkpoint.unwrap_or(0),
    }
}
