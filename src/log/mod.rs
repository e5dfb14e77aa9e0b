//! Segmented append-only log storage.
//!
//! The log is split across bounded segment files. Each segment holds a
//! contiguous index range starting at its base index, carries a sparse
//! index for seeking, and supports one writer plus any number of concurrent
//! readers. The manager owns the ordered segment collection and drives
//! rollover, truncation and compaction.
//!
//! # Module Structure
//!
//! - `entry`: entry frame codec and the `Indexed` wrapper
//! - `index`: sparse index mapping log indices to byte offsets
//! - `segment`: a single file-backed segment with recovery
//! - `reader`: dual-mode (file / memory-mapped) positioned reader
//! - `writer`: the single append path for the open segment
//! - `manager`: multi-segment lifecycle and routing

mod entry;
mod index;
mod manager;
mod reader;
mod segment;
mod writer;


pub use entry::{
    Entry, FrameOutcome, Indexed, FRAME_HEADER_SIZE, FRAME_MAGIC, decode_frame, encode_frame,
};
pub use index::{Position, SparseIndex};
pub use manager::{LogManager, LogManagerOptions, DEFAULT_MAX_ENTRY_SIZE, DEFAULT_MAX_SEGMENT_SIZE};
pub use reader::SegmentReader;
pub use segment::{LogSegment, SegmentDescriptor, SegmentLimits};
pub use writer::SegmentWriter;
