use std::{fs::File, os::unix::fs::FileExt, sync::Arc};

use memmap2::Mmap;

use crate::error::{Result, StorageError};

use super::{
    entry::{Entry, FRAME_HEADER_SIZE, FrameOutcome, Indexed, decode_frame},
    segment::LogSegment,
};

/// Byte access strategy behind a reader: positional file reads for cold
/// segments, a shared memory-mapped view for hot ones.
enum Source {
    File(Arc<File>),
    /// The view is acquired lazily and refreshed when the writer has
    /// appended past its end, so mapping an empty or still-growing tail
    /// segment works.
    Mapped(Option<Arc<Mmap>>),
}

/// Cursor state owned by one strategy instance. Swapping strategies builds
/// a fresh cursor and repositions it; no cursor state is shared.
struct Cursor<E> {
    source: Source,
    /// Offset of the first byte of the next unreturned frame.
    offset: u64,
    next_index: u64,
    current: Option<Indexed<E>>,
    /// Read-ahead: the frame at `offset`, decoded but not yet returned.
    peeked: Option<Indexed<E>>,
}

impl<E: Entry> Cursor<E> {
    fn new(source: Source, base_index: u64) -> Self {
        Self {
            source,
            offset: 0,
            next_index: base_index,
            current: None,
            peeked: None,
        }
    }

    /// Decodes the frame at `offset`, bounded by the segment's committed
    /// length. `None` means the cursor stands at the committed boundary;
    /// anything unreadable short of that boundary is corruption, because
    /// the writer only ever publishes whole frames.
    fn read_frame_at(&mut self, segment: &LogSegment, offset: u64) -> Result<Option<(E, u32)>> {
        let committed = segment.committed();
        if offset >= committed {
            return Ok(None);
        }
        let corrupt = || StorageError::CorruptFrame {
            segment_id: segment.id(),
            offset,
        };
        let max_entry_size = segment.limits().max_entry_size;

        let outcome = match &mut self.source {
            Source::File(file) => {
                if committed - offset < FRAME_HEADER_SIZE as u64 {
                    return Err(corrupt());
                }
                let mut header = [0u8; FRAME_HEADER_SIZE];
                file.read_exact_at(&mut header, offset)?;
                let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
                if len < FRAME_HEADER_SIZE as u64 || offset + len > committed {
                    return Err(corrupt());
                }
                let mut frame = vec![0u8; len as usize];
                frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
                file.read_exact_at(&mut frame[FRAME_HEADER_SIZE..], offset + FRAME_HEADER_SIZE as u64)?;
                decode_frame::<E>(&frame, max_entry_size)
            }
            Source::Mapped(view) => {
                let stale = view
                    .as_ref()
                    .map_or(true, |map| (map.len() as u64) < committed);
                if stale {
                    *view = Some(segment.mapped_view()?);
                }
                let map = view.as_ref().unwrap();
                // A concurrent truncation may have shrunk the file below the
                // committed length loaded above; bound by whichever is
                // shorter, and treat a cursor at or past that bound as the
                // end, matching what the file path reports.
                let end = committed.min(map.len() as u64);
                if offset >= end {
                    return Ok(None);
                }
                decode_frame::<E>(&map[offset as usize..end as usize], max_entry_size)
            }
        };

        match outcome {
            FrameOutcome::Entry { entry, len } => Ok(Some((entry, len))),
            FrameOutcome::Partial | FrameOutcome::Corrupt => Err(corrupt()),
        }
    }

    fn peek(&mut self, segment: &LogSegment) -> Result<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        match self.read_frame_at(segment, self.offset)? {
            Some((entry, size)) => {
                self.peeked = Some(Indexed {
                    index: self.next_index,
                    entry,
                    size,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn advance(&mut self, segment: &LogSegment) -> Result<Option<Indexed<E>>> {
        if !self.peek(segment)? {
            return Ok(None);
        }
        let entry = self.peeked.take().unwrap();
        self.offset += entry.size as u64;
        self.next_index = entry.index + 1;
        self.current = Some(entry.clone());
        Ok(Some(entry))
    }

    /// Repositions so the next returned entry has `index`: sparse-index
    /// lookup, then a forward scan over frame boundaries.
    fn reset_to(&mut self, segment: &LogSegment, index: u64) -> Result<()> {
        let target = index.max(segment.base_index());
        let start = segment.locate(target);
        self.offset = start.offset;
        self.next_index = start.index;
        self.current = None;
        self.peeked = None;

        while self.next_index < target {
            match self.read_frame_at(segment, self.offset)? {
                Some((entry, size)) => {
                    self.current = Some(Indexed {
                        index: self.next_index,
                        entry,
                        size,
                    });
                    self.offset += size as u64;
                    self.next_index += 1;
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// A positioned reader over one segment, switchable at runtime between
/// sequential file access and memory-mapped access.
///
/// Swapping strategies transfers the logical position explicitly: the next
/// index is extracted, the old strategy is dropped (releasing its handle or
/// view), a new one is constructed and repositioned. `next_index()` before
/// and after any swap are equal, so no entry is skipped or re-read. Both
/// swaps are idempotent.
///
/// Dropping the reader always deregisters it from its segment, even when
/// the segment was sealed or deleted in the meantime.
pub struct SegmentReader<E: Entry> {
    segment: Arc<LogSegment>,
    reader_id: u64,
    cursor: Cursor<E>,
}

impl<E: Entry> SegmentReader<E> {
    pub(crate) fn new(segment: Arc<LogSegment>) -> Self {
        let reader_id = segment.register_reader();
        let cursor = Cursor::new(Source::File(segment.file_handle()), segment.base_index());
        Self {
            segment,
            reader_id,
            cursor,
        }
    }

    /// Switches to memory-mapped access. No-op if already mapped.
    pub fn map(&mut self) -> Result<()> {
        if matches!(self.cursor.source, Source::Mapped(_)) {
            return Ok(());
        }
        self.swap(Source::Mapped(None))
    }

    /// Switches back to sequential file access. No-op if not mapped.
    pub fn unmap(&mut self) -> Result<()> {
        if matches!(self.cursor.source, Source::File(_)) {
            return Ok(());
        }
        self.swap(Source::File(self.segment.file_handle()))
    }

    fn swap(&mut self, source: Source) -> Result<()> {
        let next = self.cursor.next_index;
        let mut cursor = Cursor::new(source, self.segment.base_index());
        cursor.reset_to(&self.segment, next)?;
        // Dropping the old cursor releases its file handle or mapped view.
        self.cursor = cursor;
        Ok(())
    }

    /// Index of the last entry returned, or `base_index - 1` before the
    /// first read.
    pub fn current_index(&self) -> u64 {
        self.cursor.next_index - 1
    }

    /// The last entry returned, if any. Cleared by repositioning.
    pub fn current_entry(&self) -> Option<&Indexed<E>> {
        self.cursor.current.as_ref()
    }

    /// Index of the entry the next call to [`SegmentReader::next`] returns.
    pub fn next_index(&self) -> u64 {
        self.cursor.next_index
    }

    /// Whether a complete next frame is available. On a still-open segment
    /// this can turn true later as the writer appends.
    pub fn has_next(&mut self) -> Result<bool> {
        self.cursor.peek(&self.segment)
    }

    /// Returns the next entry, or `None` at the committed boundary.
    pub fn next(&mut self) -> Result<Option<Indexed<E>>> {
        self.cursor.advance(&self.segment)
    }

    /// Repositions to the start of the segment.
    pub fn reset(&mut self) -> Result<()> {
        self.cursor.reset_to(&self.segment, self.segment.base_index())
    }

    /// Repositions so the next returned entry has `index` (clamped to the
    /// segment's range).
    pub fn reset_to(&mut self, index: u64) -> Result<()> {
        self.cursor.reset_to(&self.segment, index)
    }

    pub fn segment(&self) -> &Arc<LogSegment> {
        &self.segment
    }

    /// Releases the reader. Equivalent to dropping it; the underlying
    /// resource is released and the segment notified either way.
    pub fn close(self) {}
}

impl<E: Entry> Drop for SegmentReader<E> {
    fn drop(&mut self) {
        self.segment.close_reader(self.reader_id);
    }
}
