//! Replay pipeline
//!
//! Wires the components together for one run:
//! checkpoint → sequencer → partition stream → scheduler → sink.

use crate::replay::checkpoint::{resolve_or_override, ReplayBoundary};
use crate::replay::clock::{Nanos, SpeedFactor};
use crate::replay::error::ReplayResult;
use crate::replay::partition::{discover_partitions, PartitionSequencer, PartitionStream};
use crate::replay::scheduler::{BatchScheduler, ReplayReport};
use crate::replay::sink::Sink;
use std::path::PathBuf;
use tracing::info;

/// Validated settings for one run.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub price_folder: PathBuf,
    pub speed: SpeedFactor,
    /// Explicit start, bypassing the sink's checkpoint.
    pub resume_override: Option<Nanos>,
}

/// What a run would do, computed without writing anything.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub boundary: ReplayBoundary,
    pub sequencer: PartitionSequencer,
}

/// Resolve the boundary and select the partitions to open.
pub async fn plan<S: Sink + ?Sized>(sink: &S, options: &ReplayOptions) -> ReplayResult<ReplayPlan> {
    let boundary = resolve_or_override(sink, options.resume_override).await?;
    let discovered = discover_partitions(&options.price_folder)?;
    let total = discovered.len();
    let sequencer = PartitionSequencer::new(discovered, &boundary);

    info!(
        folder = %options.price_folder.display(),
        discovered = total,
        selected = sequencer.len(),
        first = ?sequencer.first().map(|p| p.name()),
        last = ?sequencer.last().map(|p| p.name()),
        "Partitions sequenced"
    );

    Ok(ReplayPlan { boundary, sequencer })
}

/// Run a full replay into `sink`.
pub async fn replay<S: Sink + ?Sized>(sink: &mut S, options: &ReplayOptions) -> ReplayResult<ReplayReport> {
    let ReplayPlan { boundary, sequencer } = plan(&*sink, options).await?;

    if sequencer.is_empty() {
        info!(folder = %options.price_folder.display(), "0 partitions to replay");
    }

    let mut stream = PartitionStream::new(&sequencer);
    let mut report = BatchScheduler::new(sink, boundary, options.speed)
        .run(&mut stream)
        .await?;
    report.partitions_read = stream.partitions_read();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::sink::MemorySink;
    use std::fs;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> ReplayOptions {
        ReplayOptions {
            price_folder: dir.path().to_path_buf(),
            speed: SpeedFactor::new(10_000.0).unwrap(),
            resume_override: None,
        }
    }

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(
            dir.path().join(name),
            format!("date,station_uuid,diesel,e5,e10,dieselchange,e5change,e10change\n{}", body),
        )
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "2024-01-01-prices.csv",
            "2024-01-01 09:00:00+01,s1,1.7,1.8,1.75,1,0,0\n2024-01-01 09:00:00+01,s2,1.7,1.8,1.75,1,0,0\n",
        );
        write(&dir, "2024-01-02-prices.csv", "2024-01-02 07:30:00+01,s1,1.6,1.8,1.75,1,0,0\n");

        let mut sink = MemorySink::new();
        let first = replay(&mut sink, &options(&dir)).await.unwrap();
        assert_eq!(first.events_committed, 3);
        assert_eq!(first.batches_committed, 2);
        assert_eq!(first.partitions_read, 2);

        let second = replay(&mut sink, &options(&dir)).await.unwrap();
        assert_eq!(second.events_committed, 0);
        // the boundary day and the one before it are reopened and skipped
        assert_eq!(second.events_skipped, 3);
        assert_eq!(second.partitions_read, 2);
        assert_eq!(sink.event_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_takes_precedence() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "2024-01-01-prices.csv",
            "2024-01-01 09:00:00+00,s1,1.7,1.8,1.75,1,0,0\n2024-01-01 10:00:00+00,s1,1.6,1.8,1.75,1,0,0\n",
        );

        let mut sink = MemorySink::new().unreachable();
        let mut opts = options(&dir);
        opts.resume_override = crate::replay::clock::parse_timestamp("2024-01-01T09:00:00Z");

        let report = replay(&mut sink, &opts).await.unwrap();
        assert_eq!(report.events_committed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_sink_stops_before_reading() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2024-01-01-prices.csv", "2024-01-01 09:00:00+00,s1,1.7,1.8,1.75,1,0,0\n");

        let mut sink = MemorySink::new().unreachable();
        let err = replay(&mut sink, &options(&dir)).await.unwrap_err();
        assert_eq!(err.kind(), "checkpoint_unavailable");
        assert_eq!(sink.attempts(), 0);
    }
}
