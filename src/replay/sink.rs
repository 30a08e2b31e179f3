//! Sink Adapter
//!
//! The replayer needs exactly two things from the store it writes into: the
//! timestamp of the last durably committed event, and an all-or-nothing way
//! to append a batch. Anything that provides both can be replayed into.

use crate::replay::clock::Nanos;
use crate::replay::error::SinkError;
use crate::replay::event::Batch;
use async_trait::async_trait;
use tokio::time::Instant;

/// Destination of replayed batches.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Timestamp of the most recently committed event, if any.
    /// Must reflect durably committed data only.
    async fn high_water_mark(&self) -> Result<Option<Nanos>, SinkError>;

    /// Apply every event of `batch`, or none of them.
    async fn append_batch(&mut self, batch: &Batch) -> Result<(), SinkError>;

    /// Sink identifier for logging/diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// A committed batch as seen by `MemorySink`.
#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub batch: Batch,
    /// Runtime instant at which the commit happened.
    pub committed_at: Instant,
}

/// In-process sink. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    committed: Vec<CommittedBatch>,
    attempts: usize,
    fail_on_attempt: Option<usize>,
    unreachable: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a sink that already holds `batches`.
    pub fn with_history(batches: impl IntoIterator<Item = Batch>) -> Self {
        let now = Instant::now();
        Self {
            committed: batches
                .into_iter()
                .map(|batch| CommittedBatch {
                    batch,
                    committed_at: now,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Reject the `n`-th commit attempt (1-based) and every one after it.
    pub fn fail_on_attempt(mut self, n: usize) -> Self {
        self.fail_on_attempt = Some(n);
        self
    }

    /// Make the high-water mark query fail.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Allow commits again, as a restarted store would.
    pub fn recover(&mut self) {
        self.fail_on_attempt = None;
        self.unreachable = false;
    }

    pub fn committed(&self) -> &[CommittedBatch] {
        &self.committed
    }

    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.committed.iter().map(|c| &c.batch)
    }

    pub fn event_count(&self) -> usize {
        self.committed.iter().map(|c| c.batch.len()).sum()
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn high_water_mark(&self) -> Result<Option<Nanos>, SinkError> {
        if self.unreachable {
            return Err(SinkError::new("memory sink marked unreachable"));
        }
        Ok(self
            .committed
            .iter()
            .flat_map(|c| c.batch.events())
            .map(|e| e.timestamp)
            .max())
    }

    async fn append_batch(&mut self, batch: &Batch) -> Result<(), SinkError> {
        self.attempts += 1;
        if matches!(self.fail_on_attempt, Some(n) if self.attempts >= n) {
            return Err(SinkError::new(format!("commit attempt {} rejected", self.attempts)));
        }
        self.committed.push(CommittedBatch {
            batch: batch.clone(),
            committed_at: Instant::now(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::event::Event;

    #[tokio::test]
    async fn test_memory_sink_tracks_high_water_mark() {
        let mut sink = MemorySink::new();
        assert_eq!(sink.high_water_mark().await.unwrap(), None);

        sink.append_batch(&Batch::open(Event::new(10, "a"))).await.unwrap();
        sink.append_batch(&Batch::open(Event::new(20, "b"))).await.unwrap();
        assert_eq!(sink.high_water_mark().await.unwrap(), Some(20));
        assert_eq!(sink.event_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_mark_untouched() {
        let mut sink = MemorySink::new().fail_on_attempt(2);
        sink.append_batch(&Batch::open(Event::new(10, "a"))).await.unwrap();
        assert!(sink.append_batch(&Batch::open(Event::new(20, "b"))).await.is_err());
        assert_eq!(sink.high_water_mark().await.unwrap(), Some(10));
        assert_eq!(sink.attempts(), 2);

        sink.recover();
        sink.append_batch(&Batch::open(Event::new(20, "b"))).await.unwrap();
        assert_eq!(sink.high_water_mark().await.unwrap(), Some(20));
    }
}
