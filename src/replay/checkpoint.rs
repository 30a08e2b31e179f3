//! Checkpoint Resolver
//!
//! The sink's high-water mark is the only trusted record of what has already
//! been applied. It becomes an exclusive floor: the event stamped exactly at
//! the mark was committed by a previous run and must not be applied again.

use crate::replay::clock::{format_nanos, nanos_to_date, Nanos};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::sink::Sink;
use chrono::NaiveDate;
use std::fmt;
use tracing::info;

/// Where a replay starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayBoundary {
    resume_at: Option<Nanos>,
}

impl ReplayBoundary {
    /// Replay everything, starting with the first available event.
    pub fn from_start() -> Self {
        Self { resume_at: None }
    }

    /// Replay only events strictly after `ts`.
    pub fn resume_after(ts: Nanos) -> Self {
        Self { resume_at: Some(ts) }
    }

    #[inline]
    pub fn resume_at(&self) -> Option<Nanos> {
        self.resume_at
    }

    /// Whether an event at `ts` may be replayed.
    #[inline]
    pub fn admits(&self, ts: Nanos) -> bool {
        match self.resume_at {
            Some(floor) => ts > floor,
            None => true,
        }
    }

    /// Earliest partition date that can still hold an event after the
    /// boundary. Partition names carry the local date of their rows, which
    /// runs up to a day behind UTC for negative offsets, so the floor is the
    /// day before the boundary's UTC date.
    pub fn partition_floor(&self) -> Option<NaiveDate> {
        self.resume_at
            .map(nanos_to_date)
            .map(|date| date.pred_opt().unwrap_or(date))
    }
}

impl fmt::Display for ReplayBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resume_at {
            Some(ts) => write!(f, "after {}", format_nanos(ts)),
            None => f.write_str("from start"),
        }
    }
}

/// Ask the sink where the previous run stopped.
///
/// An unreachable sink is fatal: no boundary is ever guessed.
pub async fn resolve<S: Sink + ?Sized>(sink: &S) -> ReplayResult<ReplayBoundary> {
    let mark = sink
        .high_water_mark()
        .await
        .map_err(|source| ReplayError::CheckpointUnavailable { source })?;

    let boundary = match mark {
        Some(ts) => ReplayBoundary::resume_after(ts),
        None => ReplayBoundary::from_start(),
    };

    info!(sink = sink.name(), boundary = %boundary, "Resolved replay boundary");
    Ok(boundary)
}

/// Use an explicit override when given, otherwise consult the sink.
pub async fn resolve_or_override<S: Sink + ?Sized>(
    sink: &S,
    resume_override: Option<Nanos>,
) -> ReplayResult<ReplayBoundary> {
    match resume_override {
        Some(ts) => {
            let boundary = ReplayBoundary::resume_after(ts);
            info!(boundary = %boundary, "Using resume override, sink checkpoint bypassed");
            Ok(boundary)
        }
        None => resolve(sink).await,
    }
}
