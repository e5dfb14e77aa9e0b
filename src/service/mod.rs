//! The contract a replicated service must satisfy to sit on top of the log.
//!
//! A service consumes committed entries in strict index order through
//! [`SnapshotService::apply`], and can serialize its complete state to a
//! stream and rebuild itself from one. Snapshots are what make log
//! compaction and bootstrapping a lagging replica possible without full
//! log replay.

mod map;

use std::io::{Read, Write};

use crate::{
    error::Result,
    log::{Entry, Indexed},
};

pub use map::{MapCommand, MapService};

/// State machine contract for services replicated through the log.
///
/// `backup` must be deterministic and complete: identical state produces
/// identical bytes, and the stream carries everything needed for
/// exactly-once semantics (session bookkeeping, version counters), so that
/// `restore` on a fresh instance followed by replay of the log tail equals
/// having applied every entry from the beginning. The caller coordinates
/// the index boundary; `backup` itself never observes concurrent mutation.
///
/// Streams are consumed incrementally; a snapshot is never required to fit
/// in memory at once.
pub trait SnapshotService {
    type Command: Entry;

    /// Applies one committed entry. Called in strict index order.
    fn apply(&mut self, entry: &Indexed<Self::Command>) -> Result<()>;

    /// Serializes the complete current state to `sink`.
    fn backup(&self, sink: &mut dyn Write) -> Result<()>;

    /// Clears existing state and reconstructs it solely from `source`.
    fn restore(&mut self, source: &mut dyn Read) -> Result<()>;
}
