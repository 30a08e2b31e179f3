//! Replay Clock
//!
//! Historical time is carried as UTC nanoseconds (`Nanos`). Real time is the
//! tokio monotonic clock, so pacing can be driven deterministically in tests
//! with a paused runtime.
//!
//! `VirtualClock` maps a historical timestamp onto the real-time instant at
//! which it is due, always measured from a fixed origin so that per-batch
//! processing overhead never accumulates into drift.

use crate::replay::error::{ReplayError, ReplayResult};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Layouts accepted for the `date` column after RFC 3339 has been tried.
/// The price export writes `2024-01-01 00:01:06+01`.
const OFFSET_LAYOUTS: &[&str] = &["%Y-%m-%d %H:%M:%S%#z", "%Y-%m-%d %H:%M:%S%.f%#z"];
const NAIVE_LAYOUTS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

/// Helper to convert chrono DateTime to Nanos.
#[inline]
pub fn datetime_to_nanos<Tz: TimeZone>(dt: &DateTime<Tz>) -> Option<Nanos> {
    dt.timestamp_nanos_opt()
}

/// Helper to convert Nanos to chrono DateTime.
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// Render a timestamp the way it is logged and reported.
pub fn format_nanos(nanos: Nanos) -> String {
    nanos_to_datetime(nanos).to_rfc3339()
}

/// UTC calendar date of a timestamp.
pub fn nanos_to_date(nanos: Nanos) -> NaiveDate {
    nanos_to_datetime(nanos).date_naive()
}

/// Parse a historical timestamp into Nanos.
///
/// Accepts RFC 3339, the export's `YYYY-MM-DD HH:MM:SS±HH[:MM]` layout, and an
/// offset-less layout which is taken as UTC. Returns `None` for anything else
/// or for instants outside the representable range.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return datetime_to_nanos(&dt);
    }

    for layout in OFFSET_LAYOUTS {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(s, layout) {
            return datetime_to_nanos(&dt);
        }
    }

    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
            return datetime_to_nanos(&naive.and_utc());
        }
    }

    None
}

// =============================================================================
// SPEED FACTOR
// =============================================================================

/// Ratio of historical time to real elapsed time. Always finite and positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct SpeedFactor(f64);

impl SpeedFactor {
    pub const REAL_TIME: SpeedFactor = SpeedFactor(1.0);

    pub fn new(factor: f64) -> ReplayResult<Self> {
        if factor.is_finite() && factor > 0.0 {
            Ok(Self(factor))
        } else {
            Err(ReplayError::Config(format!(
                "speed factor must be a positive finite number, got {}",
                factor
            )))
        }
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }

    /// Real duration that corresponds to `virtual_nanos` of history.
    pub fn scale(self, virtual_nanos: Nanos) -> Duration {
        if virtual_nanos <= 0 {
            return Duration::ZERO;
        }
        let secs = virtual_nanos as f64 / NANOS_PER_SEC as f64 / self.0;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for SpeedFactor {
    fn default() -> Self {
        Self::REAL_TIME
    }
}

impl TryFrom<f64> for SpeedFactor {
    type Error = ReplayError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SpeedFactor> for f64 {
    fn from(value: SpeedFactor) -> Self {
        value.0
    }
}

impl fmt::Display for SpeedFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}

// =============================================================================
// VIRTUAL CLOCK
// =============================================================================

/// Maps historical timestamps to real-time deadlines.
///
/// `deadline(t) = origin_real + (t - origin_virtual) / speed_factor`
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    origin_real: Instant,
    origin_virtual: Nanos,
    speed_factor: SpeedFactor,
}

impl VirtualClock {
    /// Anchor the clock at `origin_virtual`, with real time starting now.
    pub fn start(origin_virtual: Nanos, speed_factor: SpeedFactor) -> Self {
        Self::with_origin(Instant::now(), origin_virtual, speed_factor)
    }

    pub fn with_origin(origin_real: Instant, origin_virtual: Nanos, speed_factor: SpeedFactor) -> Self {
        Self {
            origin_real,
            origin_virtual,
            speed_factor,
        }
    }

    /// Real-time instant at which the event stamped `virtual_ts` is due.
    pub fn deadline(&self, virtual_ts: Nanos) -> Instant {
        let offset = self.speed_factor.scale(virtual_ts.saturating_sub(self.origin_virtual));
        self.origin_real
            .checked_add(offset)
            .unwrap_or_else(|| self.origin_real + Duration::from_secs(u32::MAX as u64))
    }

    /// Historical time elapsed between the origin and `virtual_ts`.
    pub fn elapsed_virtual(&self, virtual_ts: Nanos) -> Duration {
        Duration::from_nanos(virtual_ts.saturating_sub(self.origin_virtual).max(0) as u64)
    }

    /// Real time elapsed since the origin.
    pub fn elapsed_real(&self) -> Duration {
        Instant::now().saturating_duration_since(self.origin_real)
    }
}
