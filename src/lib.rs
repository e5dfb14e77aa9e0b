//! Durable, append-only segmented log storage for replicated state machines.
//!
//! The crate persists an ordered sequence of opaque entries to disk across a
//! series of bounded segment files, serves them back by index to any number
//! of concurrent readers while a single writer appends, and lets a segment's
//! readers switch between sequential file access and memory-mapped access at
//! runtime without losing their position.
//!
//! On top of the log sits the snapshot contract ([`service::SnapshotService`])
//! that every replicated service must satisfy: serialize complete state to a
//! stream, rebuild it from one. Snapshots are how the log is compacted and
//! how new or lagging replicas catch up without replaying full history.
//!
//! The consensus protocol itself (elections, terms, replication RPCs) lives
//! above this crate and is deliberately not modeled here.

pub mod error;
pub mod log;
pub mod service;

pub use error::{Result, StorageError};
pub use log::{
    Entry, FrameOutcome, Indexed, LogManager, LogManagerOptions, LogSegment, Position,
    SegmentReader, SegmentWriter, SparseIndex,
};
pub use service::{MapCommand, MapService, SnapshotService};
