//! Historical Price Replay
//!
//! Re-emits recorded fuel-price updates into a store at a controllable pace,
//! resuming from whatever the store already holds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          replayer                               │
//! │  (resolves the boundary, sequences partitions, drives the run)  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ checkpoint  │        │ partition   │        │ VirtualClock│
//! │ (sink HWM)  │        │ (daily CSV) │        │ (speed x)   │
//! └─────────────┘        └─────────────┘        └─────────────┘
//!                                │                       │
//!                                └───────────┬───────────┘
//!                                            ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       BatchScheduler                            │
//! │  SeekingStart → Replaying → Draining → Done                     │
//! │  one Batch per distinct timestamp, committed at its deadline    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//!                         ┌─────────────┐
//!                         │ Sink        │
//!                         │ (SQLite /   │
//!                         │  memory)    │
//!                         └─────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Ordering**: events reach the sink in non-decreasing timestamp order;
//!   any regression aborts the run before the offending partition is emitted
//! - **Atomicity**: a batch is committed whole or not at all
//! - **Resumption**: a restart skips everything at or before the store's
//!   high-water mark, so re-running is idempotent
//! - **Pacing**: deadlines are anchored to the first replayed event, so
//!   scheduling jitter never accumulates

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod partition;
pub mod replayer;
pub mod scheduler;
pub mod sink;
pub mod sqlite_sink;

pub use checkpoint::ReplayBoundary;
pub use clock::{parse_timestamp, Nanos, SpeedFactor, VirtualClock};
pub use config::ReplayConfig;
pub use error::{ReplayError, ReplayResult, SinkError};
pub use event::{Batch, Event, FieldValue};
pub use partition::{discover_partitions, PartitionId, PartitionSequencer};
pub use replayer::{plan, replay, ReplayOptions, ReplayPlan};
pub use scheduler::{BatchScheduler, Phase, ReplayReport};
pub use sink::{MemorySink, Sink};
pub use sqlite_sink::{PriceStoreStatus, SqliteSink};
