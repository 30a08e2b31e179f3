//! Partitions and the Source Sequencer
//!
//! A partition is one day of price updates, stored as `YYYY-MM-DD-prices.csv`.
//! File names sort chronologically, and rows inside a file are expected to be
//! non-decreasing in time.
//!
//! The sequencer is a coarse, date-level pre-filter: it keeps every partition
//! dated no earlier than the day before the boundary's UTC date. Exact
//! timestamp filtering is left to the scheduler, because the partitions around
//! the boundary straddle the checkpoint.

use crate::replay::checkpoint::ReplayBoundary;
use crate::replay::clock::{format_nanos, Nanos};
use crate::replay::error::{RecordLocation, ReplayError, ReplayResult};
use crate::replay::event::{Event, RecordLayout};
use chrono::NaiveDate;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name suffix that marks a price partition.
pub const PARTITION_SUFFIX: &str = "-prices.csv";

/// Identifies one partition file and the date embedded in its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    // field order drives the derived Ord: date first, then name
    date: NaiveDate,
    name: String,
    path: PathBuf,
}

impl PartitionId {
    /// Build an id from a file path, or `None` if the name does not follow
    /// the `YYYY-MM-DD-prices.csv` convention.
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?.to_string();
        let date = Self::date_from_name(&name)?;
        Some(Self { date, name, path })
    }

    /// Extract the embedded date from a partition file name.
    pub fn date_from_name(name: &str) -> Option<NaiveDate> {
        let prefix = name.strip_suffix(PARTITION_SUFFIX)?;
        NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
    }

    #[inline]
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// Recursively collect every partition file under `root`.
///
/// Unrelated files are skipped. The result is unordered; ordering is the
/// sequencer's job.
pub fn discover_partitions(root: &Path) -> ReplayResult<Vec<PartitionId>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| ReplayError::Discovery {
            path: dir.clone(),
            reason: e.to_string(),
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| ReplayError::Discovery {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Some(id) = PartitionId::from_path(&path) {
                found.push(id);
            } else {
                debug!(path = %path.display(), "Skipping non-partition file");
            }
        }
    }

    Ok(found)
}

// =============================================================================
// SOURCE SEQUENCER
// =============================================================================

/// Orders partitions by date and drops those entirely before the boundary.
#[derive(Debug, Clone)]
pub struct PartitionSequencer {
    partitions: Vec<PartitionId>,
}

impl PartitionSequencer {
    pub fn new(mut partitions: Vec<PartitionId>, boundary: &ReplayBoundary) -> Self {
        if let Some(floor) = boundary.partition_floor() {
            partitions.retain(|p| p.date() >= floor);
        }
        partitions.sort();
        partitions.dedup_by(|a, b| a.path == b.path);
        Self { partitions }
    }

    /// Iterate the selected partitions in chronological order. Each call
    /// starts again from the first partition.
    pub fn iter(&self) -> std::slice::Iter<'_, PartitionId> {
        self.partitions.iter()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn first(&self) -> Option<&PartitionId> {
        self.partitions.first()
    }

    pub fn last(&self) -> Option<&PartitionId> {
        self.partitions.last()
    }
}

impl<'a> IntoIterator for &'a PartitionSequencer {
    type Item = &'a PartitionId;
    type IntoIter = std::slice::Iter<'a, PartitionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// PARTITION LOADING
// =============================================================================

/// Decode a whole partition and verify it is non-decreasing in time.
///
/// The file is validated before any of its events are handed out, so a
/// malformed or unsorted partition never contributes a commit.
pub fn load_partition(partition: &PartitionId) -> ReplayResult<Vec<Event>> {
    let name = partition.name();
    let io_err = |e: csv::Error| ReplayError::Discovery {
        path: partition.path().to_path_buf(),
        reason: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(partition.path())
        .map_err(io_err)?;

    let headers = reader.headers().map_err(io_err)?.clone();
    let layout = RecordLayout::from_headers(&headers, name)?;

    let mut events: Vec<Event> = Vec::new();
    let mut previous: Option<Nanos> = None;

    for (idx, record) in reader.records().enumerate() {
        // header is line 1
        let line = idx as u64 + 2;
        let record = record.map_err(|e| ReplayError::malformed(name, line, e.to_string()))?;
        let event = layout.decode(&record, name, line)?;

        if let Some(prev) = previous {
            if event.timestamp < prev {
                return Err(ReplayError::OutOfOrder {
                    location: Some(RecordLocation {
                        partition: name.to_string(),
                        line,
                    }),
                    previous: prev,
                    found: event.timestamp,
                });
            }
        }
        previous = Some(event.timestamp);
        events.push(event);
    }

    Ok(events)
}

/// Lazily walks the sequenced partitions, yielding their events in order.
///
/// Partitions are opened one at a time, only when the previous one has been
/// fully consumed. After the first error the stream ends.
pub struct PartitionStream<'a> {
    partitions: std::slice::Iter<'a, PartitionId>,
    current: std::vec::IntoIter<Event>,
    current_name: Option<&'a str>,
    partitions_read: usize,
    failed: bool,
}

impl<'a> PartitionStream<'a> {
    pub fn new(sequencer: &'a PartitionSequencer) -> Self {
        Self {
            partitions: sequencer.iter(),
            current: Vec::new().into_iter(),
            current_name: None,
            partitions_read: 0,
            failed: false,
        }
    }

    /// Number of partitions opened so far.
    pub fn partitions_read(&self) -> usize {
        self.partitions_read
    }

    fn finish_current(&mut self) {
        if let Some(name) = self.current_name.take() {
            info!(partition = %name, "Processed partition");
        }
    }
}

impl Iterator for PartitionStream<'_> {
    type Item = ReplayResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if let Some(event) = self.current.next() {
                return Some(Ok(event));
            }
            self.finish_current();

            let partition = self.partitions.next()?;
            match load_partition(partition) {
                Ok(events) => {
                    self.partitions_read += 1;
                    let first = events.first().map(|e| format_nanos(e.timestamp));
                    info!(
                        partition = %partition,
                        events = events.len(),
                        first = ?first,
                        "Reading partition"
                    );
                    self.current_name = Some(partition.name());
                    self.current = events.into_iter();
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
