//! Batch Scheduler / Pacer
//!
//! Consumes the ordered event stream, groups equal-timestamp events into
//! batches, and commits each batch to the sink at the real-time instant the
//! virtual clock assigns to it.
//!
//! # State machine
//!
//! ```text
//!  SeekingStart ──first event past boundary──▶ Replaying ──end of stream──▶ Draining ──▶ Done
//!       │ skip ts <= resume_at                   │ equal ts: append
//!       └──────────────────────                  │ greater ts: flush, pace, open
//!                                                │ smaller ts: OutOfOrder
//! ```
//!
//! # Guarantees
//!
//! - Commits are strictly sequential; a batch is never committed while the
//!   previous commit is outstanding.
//! - The first eligible event anchors the virtual clock; deadlines are always
//!   computed from that fixed origin.
//! - The final batch is flushed with no pacing wait.
//! - All scheduler state lives in this struct and dies with the run.

use crate::replay::checkpoint::ReplayBoundary;
use crate::replay::clock::{format_nanos, Nanos, SpeedFactor, VirtualClock};
use crate::replay::error::{ReplayError, ReplayResult};
use crate::replay::event::{Batch, Event};
use crate::replay::sink::Sink;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Observable phase of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    SeekingStart,
    Replaying,
    Draining,
    Done,
}

enum SchedulerState {
    SeekingStart,
    Replaying { clock: VirtualClock, open: Batch },
    Draining,
    Done,
}

/// Outcome of a replay run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub boundary: Option<String>,
    pub speed_factor: f64,
    pub partitions_read: usize,
    pub events_seen: u64,
    pub events_skipped: u64,
    pub events_committed: u64,
    pub batches_committed: u64,
    pub first_committed: Option<String>,
    pub last_committed: Option<String>,
    pub pacing_sleeps: u64,
    pub total_sleep_ms: u64,
}

/// Paces and commits one replay run.
pub struct BatchScheduler<'s, S: Sink + ?Sized> {
    sink: &'s mut S,
    boundary: ReplayBoundary,
    speed: SpeedFactor,
    state: SchedulerState,
    last_seen: Option<Nanos>,
    last_committed: Option<Nanos>,
    total_sleep: Duration,
    report: ReplayReport,
}

impl<'s, S: Sink + ?Sized> BatchScheduler<'s, S> {
    pub fn new(sink: &'s mut S, boundary: ReplayBoundary, speed: SpeedFactor) -> Self {
        Self {
            sink,
            boundary,
            speed,
            state: SchedulerState::SeekingStart,
            last_seen: None,
            last_committed: None,
            total_sleep: Duration::ZERO,
            report: ReplayReport {
                boundary: boundary.resume_at().map(format_nanos),
                speed_factor: speed.get(),
                ..ReplayReport::default()
            },
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            SchedulerState::SeekingStart => Phase::SeekingStart,
            SchedulerState::Replaying { .. } => Phase::Replaying,
            SchedulerState::Draining => Phase::Draining,
            SchedulerState::Done => Phase::Done,
        }
    }

    /// Timestamp of the last batch this run committed.
    pub fn last_committed(&self) -> Option<Nanos> {
        self.last_committed
    }

    /// Drive the whole stream, then drain.
    pub async fn run<I>(mut self, events: I) -> ReplayResult<ReplayReport>
    where
        I: IntoIterator<Item = ReplayResult<Event>>,
    {
        for event in events {
            self.offer(event?).await?;
        }
        self.finish().await
    }

    /// Feed the next event of the stream.
    pub async fn offer(&mut self, event: Event) -> ReplayResult<()> {
        if matches!(self.state, SchedulerState::Draining | SchedulerState::Done) {
            return Err(ReplayError::Stopped);
        }
        self.report.events_seen += 1;

        if let Some(prev) = self.last_seen {
            if event.timestamp < prev {
                return Err(ReplayError::OutOfOrder {
                    location: None,
                    previous: prev,
                    found: event.timestamp,
                });
            }
        }
        self.last_seen = Some(event.timestamp);

        match std::mem::replace(&mut self.state, SchedulerState::Done) {
            SchedulerState::SeekingStart => {
                if !self.boundary.admits(event.timestamp) {
                    self.report.events_skipped += 1;
                    self.state = SchedulerState::SeekingStart;
                    return Ok(());
                }

                let clock = VirtualClock::start(event.timestamp, self.speed);
                info!(
                    origin = %format_nanos(event.timestamp),
                    skipped = self.report.events_skipped,
                    speed = %self.speed,
                    "Replay started"
                );
                self.state = SchedulerState::Replaying {
                    clock,
                    open: Batch::open(event),
                };
                Ok(())
            }
            SchedulerState::Replaying { clock, mut open } => {
                if event.timestamp == open.timestamp() {
                    open.push(event);
                    self.state = SchedulerState::Replaying { clock, open };
                    return Ok(());
                }

                // strictly greater: regressions were rejected above
                self.commit(&open).await?;
                self.pace(&clock, event.timestamp).await;
                self.state = SchedulerState::Replaying {
                    clock,
                    open: Batch::open(event),
                };
                Ok(())
            }
            stopped @ (SchedulerState::Draining | SchedulerState::Done) => {
                self.state = stopped;
                Err(ReplayError::Stopped)
            }
        }
    }

    /// End of stream: flush the open batch without waiting.
    ///
    /// The scheduler stays in `Draining` if the final commit fails, and
    /// rejects further events either way.
    pub async fn finish(&mut self) -> ReplayResult<ReplayReport> {
        match std::mem::replace(&mut self.state, SchedulerState::Draining) {
            SchedulerState::Replaying { open, .. } => {
                self.commit(&open).await?;
            }
            SchedulerState::SeekingStart => {
                info!(
                    skipped = self.report.events_skipped,
                    "No events past the boundary, nothing to replay"
                );
            }
            SchedulerState::Draining | SchedulerState::Done => {}
        }
        self.state = SchedulerState::Done;

        self.report.total_sleep_ms = self.total_sleep.as_millis() as u64;
        info!(
            batches = self.report.batches_committed,
            events = self.report.events_committed,
            skipped = self.report.events_skipped,
            slept_ms = self.report.total_sleep_ms,
            "Replay finished"
        );
        Ok(self.report.clone())
    }

    async fn commit(&mut self, batch: &Batch) -> ReplayResult<()> {
        self.sink
            .append_batch(batch)
            .await
            .map_err(|source| ReplayError::Commit {
                batch_timestamp: batch.timestamp(),
                batch_len: batch.len(),
                source,
            })?;

        info!(
            count = batch.len(),
            after = ?self.last_committed.map(format_nanos),
            at = %format_nanos(batch.timestamp()),
            "Inserted batch"
        );

        if self.report.first_committed.is_none() {
            self.report.first_committed = Some(format_nanos(batch.timestamp()));
        }
        self.report.last_committed = Some(format_nanos(batch.timestamp()));
        self.report.batches_committed += 1;
        self.report.events_committed += batch.len() as u64;
        self.last_committed = Some(batch.timestamp());
        Ok(())
    }

    async fn pace(&mut self, clock: &VirtualClock, next_ts: Nanos) {
        let deadline = clock.deadline(next_ts);
        let now = Instant::now();
        if deadline <= now {
            return;
        }

        let wait = deadline - now;
        debug!(
            elapsed_virtual_s = clock.elapsed_virtual(next_ts).as_secs_f64(),
            elapsed_real_s = clock.elapsed_real().as_secs_f64(),
            sleep_s = wait.as_secs_f64(),
            "Pacing"
        );
        sleep_until(deadline).await;
        self.total_sleep += wait;
        self.report.pacing_sleeps += 1;
    }
}
