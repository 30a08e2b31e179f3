//! Cedar Replay Library
//!
//! Historical fuel-price replay: decoding, sequencing, pacing and storage.
//! The `cedar-replay` binary is a thin CLI over [`replay`].

pub mod replay;
