//! Replay error taxonomy.
//!
//! Every variant is fatal to a run. Recovery happens by restarting, which
//! re-derives the resume point from the sink's high-water mark.

use crate::replay::clock::{format_nanos, Nanos};
use std::fmt;
use std::path::PathBuf;

pub type ReplayResult<T> = Result<T, ReplayError>;

/// Failure reported by a sink implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SinkError {}

impl From<rusqlite::Error> for SinkError {
    fn from(e: rusqlite::Error) -> Self {
        Self::new(format!("sqlite: {}", e))
    }
}

/// Where a bad record was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocation {
    pub partition: String,
    /// 1-based line in the source file, header included.
    pub line: u64,
}

impl fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.line)
    }
}

#[derive(Debug, Clone)]
pub enum ReplayError {
    /// A row could not be decoded into an event.
    MalformedRecord {
        location: RecordLocation,
        reason: String,
    },
    /// An event arrived with a timestamp earlier than one already seen.
    OutOfOrder {
        location: Option<RecordLocation>,
        previous: Nanos,
        found: Nanos,
    },
    /// The sink could not report its high-water mark at start-up.
    CheckpointUnavailable { source: SinkError },
    /// The sink rejected a batch.
    Commit {
        batch_timestamp: Nanos,
        batch_len: usize,
        source: SinkError,
    },
    /// The partition folder or one of its files could not be read.
    Discovery { path: PathBuf, reason: String },
    /// Invalid configuration.
    Config(String),
    /// An event was offered to a scheduler that already stopped.
    Stopped,
}

impl ReplayError {
    /// Short stable name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRecord { .. } => "malformed_record",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::CheckpointUnavailable { .. } => "checkpoint_unavailable",
            Self::Commit { .. } => "commit_failed",
            Self::Discovery { .. } => "discovery",
            Self::Config(_) => "config",
            Self::Stopped => "stopped",
        }
    }

    pub(crate) fn malformed(partition: &str, line: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            location: RecordLocation {
                partition: partition.to_string(),
                line,
            },
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRecord { location, reason } => {
                write!(f, "malformed record at {}: {}", location, reason)
            }
            Self::OutOfOrder {
                location,
                previous,
                found,
            } => {
                write!(
                    f,
                    "out-of-order event: {} follows {}",
                    format_nanos(*found),
                    format_nanos(*previous)
                )?;
                if let Some(loc) = location {
                    write!(f, " at {}", loc)?;
                }
                Ok(())
            }
            Self::CheckpointUnavailable { source } => {
                write!(f, "cannot resolve replay checkpoint: {}", source)
            }
            Self::Commit {
                batch_timestamp,
                batch_len,
                source,
            } => write!(
                f,
                "commit of batch at {} ({} events) failed: {}",
                format_nanos(*batch_timestamp),
                batch_len,
                source
            ),
            Self::Discovery { path, reason } => {
                write!(f, "cannot read {}: {}", path.display(), reason)
            }
            Self::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Stopped => f.write_str("scheduler already stopped"),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CheckpointUnavailable { source } => Some(source),
            Self::Commit { source, .. } => Some(source),
            _ => None,
        }
    }
}
