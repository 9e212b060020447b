//! Crash-safe journaling for the Quasar engine
//!
//! Append-only segmented write-ahead log. Records are length-prefixed,
//! sequence-stamped, type-tagged and CRC-checked; recovery replays in
//! order and stops at the first invalid record.

pub mod segment;
pub mod wal;

pub use segment::{Record, ScanStop, Segment, SegmentReader};
pub use wal::{Recovery, Wal};
