use std::{fs::File, marker::PhantomData, os::unix::fs::FileExt, sync::Arc};

use tracing::warn;

use crate::error::{Result, StorageError};

use super::{
    entry::{Entry, Indexed, encode_frame},
    segment::LogSegment,
};

/// The single append path for one open segment.
///
/// Exactly one writer exists per open segment; the manager enforces this by
/// holding the only one. Appends write the whole frame before publishing
/// the new committed length through the segment, so concurrent tailing
/// readers never observe a torn frame.
pub struct SegmentWriter<E: Entry> {
    segment: Arc<LogSegment>,
    file: Arc<File>,
    /// Write cursor; always equal to the segment's committed length.
    offset: u64,
    next_index: u64,
    _entry: PhantomData<fn(E)>,
}

impl<E: Entry> SegmentWriter<E> {
    pub(crate) fn new(segment: Arc<LogSegment>) -> Self {
        debug_assert!(!segment.is_sealed(), "cannot write a sealed segment");
        let offset = segment.committed();
        let next_index = segment.last_index() + 1;
        let file = segment.file_handle();
        Self {
            segment,
            file,
            offset,
            next_index,
            _entry: PhantomData,
        }
    }

    /// Appends one entry: assigns the next index, frames it, writes the
    /// frame and advances the sparse index.
    ///
    /// Fails with [`StorageError::EntryTooLarge`] before touching the file
    /// when the payload exceeds the entry bound, and with
    /// [`StorageError::SegmentFull`] when the frame would push the segment
    /// past its size bound; the caller rolls to a new segment then. A
    /// segment always accepts at least one frame regardless of the size
    /// bound so an oversized-but-legal entry cannot roll forever.
    pub fn append(&mut self, entry: &E) -> Result<Indexed<E>> {
        let limits = self.segment.limits();
        let frame = encode_frame(entry, limits.max_entry_size)?;
        let len = frame.len() as u64;

        if self.offset > 0 && self.offset + len > limits.max_segment_size {
            return Err(StorageError::SegmentFull {
                segment_id: self.segment.id(),
            });
        }

        self.file.write_all_at(&frame, self.offset).map_err(|e| {
            warn!(
                "failed to write frame to segment {}: {}",
                self.segment.id(),
                e
            );
            e
        })?;

        let index = self.next_index;
        self.segment.record_append(index, self.offset, len);
        self.offset += len;
        self.next_index += 1;

        Ok(Indexed {
            index,
            entry: entry.clone(),
            size: len as u32,
        })
    }

    /// Forces everything written so far onto durable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            warn!("failed to sync segment {}: {}", self.segment.id(), e);
            e.into()
        })
    }

    /// Discards all entries with index `>= index` and repositions the write
    /// cursor, so the next append is assigned `index`. Entries below are
    /// untouched. A no-op when `index` is at or past the next index.
    pub fn truncate(&mut self, index: u64) -> Result<()> {
        if index >= self.next_index {
            return Ok(());
        }
        let index = index.max(self.segment.base_index());

        // Walk frame boundaries from the nearest indexed position.
        let start = self.segment.locate(index);
        let mut offset = start.offset;
        let mut at = start.index;
        while at < index {
            offset += self.segment.frame_len_at(offset)?;
            at += 1;
        }

        self.segment.truncate_from(index, offset)?;
        self.offset = offset;
        self.next_index = index;
        Ok(())
    }

    /// Index the next appended entry will be assigned.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn last_index(&self) -> u64 {
        self.next_index - 1
    }

    /// Bytes of committed frames in the segment.
    pub fn size(&self) -> u64 {
        self.offset
    }

    pub(crate) fn segment(&self) -> &Arc<LogSegment> {
        &self.segment
    }
}
