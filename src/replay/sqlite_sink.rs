//! SQLite Price Store
//!
//! Persistent sink for replayed price updates. Each batch is applied inside a
//! single `BEGIN IMMEDIATE` transaction, so the high-water mark (`MAX(time_ns)`)
//! only ever reflects whole batches.

use crate::replay::clock::{format_nanos, Nanos};
use crate::replay::error::SinkError;
use crate::replay::event::{Batch, Event, FieldValue};
use crate::replay::sink::Sink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// STORAGE SCHEMA
// =============================================================================

const PRICE_STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS prices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    time_ns INTEGER NOT NULL,
    time TEXT NOT NULL,
    station_uuid TEXT NOT NULL,
    diesel REAL NOT NULL,
    e5 REAL NOT NULL,
    e10 REAL NOT NULL,
    diesel_change INTEGER NOT NULL,
    e5_change INTEGER NOT NULL,
    e10_change INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prices_time ON prices(time_ns);
CREATE INDEX IF NOT EXISTS idx_prices_station_time ON prices(station_uuid, time_ns);
"#;

/// Default busy timeout; bounds how long a commit may wait for the write lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary of what the store holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriceStoreStatus {
    pub rows: i64,
    pub stations: i64,
    pub first_time_ns: Option<i64>,
    pub last_time_ns: Option<i64>,
    pub first_time: Option<String>,
    pub last_time: Option<String>,
}

// =============================================================================
// PRICE STORE
// =============================================================================

pub struct SqliteSink {
    conn: Mutex<Connection>,
    path: String,
}

impl SqliteSink {
    /// Open or create the store at the given path.
    pub fn open(db_path: &str, busy_timeout: Duration) -> Result<Self> {
        let path = Path::new(db_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open price database: {}", db_path))?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(PRICE_STORE_SCHEMA)?;

        info!(path = %db_path, "Price store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path.to_string(),
        })
    }

    /// Open an existing store without write access.
    pub fn open_read_only(db_path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open price database: {}", db_path))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path.to_string(),
        })
    }

    /// Open in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(PRICE_STORE_SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: ":memory:".to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Row count and time coverage.
    pub fn status(&self) -> Result<PriceStoreStatus> {
        let conn = self.conn.lock();
        let (rows, stations, first, last): (i64, i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT station_uuid), MIN(time_ns), MAX(time_ns) FROM prices",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(PriceStoreStatus {
            rows,
            stations,
            first_time_ns: first,
            last_time_ns: last,
            first_time: first.map(format_nanos),
            last_time: last.map(format_nanos),
        })
    }

    /// Number of stored rows stamped exactly `ts`.
    pub fn count_at(&self, ts: Nanos) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM prices WHERE time_ns = ?1", params![ts], |row| {
            row.get(0)
        })?)
    }

    fn insert_event(conn: &Connection, event: &Event) -> Result<(), SinkError> {
        let price = |name: &str| -> Result<f64, SinkError> {
            event
                .field(name)
                .and_then(FieldValue::as_f64)
                .ok_or_else(|| SinkError::new(format!("event for {} lacks `{}`", event.entity_id, name)))
        };
        let flag = |name: &str| -> Result<i64, SinkError> {
            event
                .field(name)
                .and_then(FieldValue::as_i64)
                .ok_or_else(|| SinkError::new(format!("event for {} lacks `{}`", event.entity_id, name)))
        };

        conn.execute(
            r#"
            INSERT INTO prices (
                time_ns, time, station_uuid,
                diesel, e5, e10,
                diesel_change, e5_change, e10_change
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                event.timestamp,
                format_nanos(event.timestamp),
                event.entity_id,
                price("diesel")?,
                price("e5")?,
                price("e10")?,
                flag("dieselchange")?,
                flag("e5change")?,
                flag("e10change")?,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl Sink for SqliteSink {
    async fn high_water_mark(&self) -> Result<Option<Nanos>, SinkError> {
        let conn = self.conn.lock();
        let mark: Option<i64> = conn.query_row("SELECT MAX(time_ns) FROM prices", [], |row| row.get(0))?;
        Ok(mark)
    }

    async fn append_batch(&mut self, batch: &Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        for event in batch.events() {
            if let Err(e) = Self::insert_event(&conn, event) {
                if let Err(rollback) = conn.execute("ROLLBACK", []) {
                    debug!(error = %rollback, "Rollback after failed insert also failed");
                }
                return Err(e);
            }
        }

        if let Err(e) = conn.execute("COMMIT", []) {
            if let Err(rollback) = conn.execute("ROLLBACK", []) {
                debug!(error = %rollback, "Rollback after failed commit also failed");
            }
            return Err(e.into());
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
