//! Event Model and Decoder
//!
//! A price update decoded from one CSV row. Events compare by timestamp only:
//! two updates stamped with the same instant are "simultaneous" no matter
//! which station they belong to.
//!
//! Decoding is pure. Column positions are resolved once from the header
//! (`RecordLayout`) and every row is then coerced against that layout.

use crate::replay::clock::{format_nanos, parse_timestamp, Nanos};
use crate::replay::error::{ReplayError, ReplayResult};
use csv::StringRecord;
use serde::Serialize;
use std::cmp::Ordering;

/// Column holding the event timestamp.
pub const TIMESTAMP_COLUMN: &str = "date";
/// Column holding the entity (station) id.
pub const ENTITY_COLUMN: &str = "station_uuid";

/// Measurement columns, in the order they are kept on the event.
pub const MEASUREMENT_COLUMNS: &[(&str, FieldKind)] = &[
    ("diesel", FieldKind::Price),
    ("e5", FieldKind::Price),
    ("e10", FieldKind::Price),
    ("dieselchange", FieldKind::ChangeFlag),
    ("e5change", FieldKind::ChangeFlag),
    ("e10change", FieldKind::ChangeFlag),
];

/// How a measurement column is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Decimal price, parsed as f64.
    Price,
    /// Integer change indicator.
    ChangeFlag,
}

/// A decoded measurement value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Integer(i64),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Number(_) => None,
        }
    }
}

/// One historical update.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: Nanos,
    pub entity_id: String,
    /// Named values in source column order.
    pub fields: Vec<(String, FieldValue)>,
}

impl Event {
    pub fn new(timestamp: Nanos, entity_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            entity_id: entity_id.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

// =============================================================================
// BATCH
// =============================================================================

/// Events sharing exactly one timestamp. The unit of commit and of pacing.
#[derive(Debug, Clone)]
pub struct Batch {
    timestamp: Nanos,
    events: Vec<Event>,
}

impl Batch {
    /// Open a batch with its first event.
    pub fn open(first: Event) -> Self {
        Self {
            timestamp: first.timestamp,
            events: vec![first],
        }
    }

    /// Add a simultaneous event. The caller guarantees the timestamp matches.
    pub fn push(&mut self, event: Event) {
        debug_assert_eq!(event.timestamp, self.timestamp, "Batch: timestamp mismatch");
        self.events.push(event);
    }

    #[inline]
    pub fn timestamp(&self) -> Nanos {
        self.timestamp
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }
}

impl std::fmt::Display for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x{}", format_nanos(self.timestamp), self.events.len())
    }
}

// =============================================================================
// DECODER
// =============================================================================

/// Column indices resolved from a partition's header row.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    timestamp_idx: usize,
    entity_idx: usize,
    measurements: Vec<(&'static str, FieldKind, usize)>,
}

impl RecordLayout {
    /// Resolve every required column. A missing column makes every row of the
    /// partition malformed, so it is reported against the header line.
    pub fn from_headers(headers: &StringRecord, partition: &str) -> ReplayResult<Self> {
        let position = |name: &str| -> ReplayResult<usize> {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| ReplayError::malformed(partition, 1, format!("missing column `{}`", name)))
        };

        let timestamp_idx = position(TIMESTAMP_COLUMN)?;
        let entity_idx = position(ENTITY_COLUMN)?;
        let measurements = MEASUREMENT_COLUMNS
            .iter()
            .map(|&(name, kind)| position(name).map(|idx| (name, kind, idx)))
            .collect::<ReplayResult<Vec<_>>>()?;

        Ok(Self {
            timestamp_idx,
            entity_idx,
            measurements,
        })
    }

    /// Decode one row into an event.
    pub fn decode(&self, record: &StringRecord, partition: &str, line: u64) -> ReplayResult<Event> {
        let field = |idx: usize, name: &str| required(record, idx, name, partition, line);

        let raw_ts = field(self.timestamp_idx, TIMESTAMP_COLUMN)?;
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            ReplayError::malformed(partition, line, format!("unparseable timestamp {:?}", raw_ts))
        })?;

        let entity_id = field(self.entity_idx, ENTITY_COLUMN)?.to_string();

        let mut fields = Vec::with_capacity(self.measurements.len());
        for &(name, kind, idx) in &self.measurements {
            let raw = field(idx, name)?;
            let value = match kind {
                FieldKind::Price => raw
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(FieldValue::Number),
                FieldKind::ChangeFlag => raw.parse::<i64>().ok().map(FieldValue::Integer),
            }
            .ok_or_else(|| {
                ReplayError::malformed(partition, line, format!("non-numeric `{}`: {:?}", name, raw))
            })?;
            fields.push((name.to_string(), value));
        }

        Ok(Event {
            timestamp,
            entity_id,
            fields,
        })
    }
}

fn required<'r>(
    record: &'r StringRecord,
    idx: usize,
    name: &str,
    partition: &str,
    line: u64,
) -> ReplayResult<&'r str> {
    match record.get(idx).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ReplayError::malformed(partition, line, format!("missing field `{}`", name))),
    }
}
