use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Result, StorageError};

use super::{
    entry::{Entry, FRAME_HEADER_SIZE, FRAME_MAGIC, FrameOutcome, decode_frame},
    index::{Position, SparseIndex},
};

/// Identity of one segment: its id, the first index it may hold, and the
/// backing file.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub id: u64,
    pub base_index: u64,
    pub path: PathBuf,
}

/// Size bounds shared by a segment, its writer and its readers.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    pub max_segment_size: u64,
    pub max_entry_size: usize,
    pub index_granularity: u64,
}

/// One bounded, file-backed contiguous range of the log.
///
/// A segment is created empty and writable, appended to by exactly one
/// writer, and sealed once full. Sealed segments are logically immutable
/// and safe for unsynchronized concurrent reads. Readers register here by
/// id only (never an owning reference) so the manager can tell when a
/// segment is safe to delete.
///
/// `committed` is the byte length covering only fully written frames. The
/// writer publishes it after each complete frame write and readers never
/// look past it, which is what makes tailing reads torn-frame free.
pub struct LogSegment {
    descriptor: SegmentDescriptor,
    limits: SegmentLimits,
    file: Arc<File>,
    committed: AtomicU64,
    /// Highest index held; `base_index - 1` while empty.
    last_index: AtomicU64,
    index: RwLock<SparseIndex>,
    sealed: AtomicBool,
    mapped: Mutex<Option<Arc<Mmap>>>,
    readers: Mutex<HashSet<u64>>,
    next_reader_id: AtomicU64,
}

impl LogSegment {
    /// Opens (creating if absent) the segment file. The in-memory index and
    /// committed length start empty; call [`LogSegment::recover`] to rebuild
    /// them from disk content.
    pub fn create(descriptor: SegmentDescriptor, limits: SegmentLimits) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&descriptor.path)?;

        info!(
            "opened segment: id={}, base_index={}, path={:?}",
            descriptor.id, descriptor.base_index, descriptor.path
        );

        let base_index = descriptor.base_index;
        Ok(Arc::new(Self {
            descriptor,
            limits,
            file: Arc::new(file),
            committed: AtomicU64::new(0),
            last_index: AtomicU64::new(base_index - 1),
            index: RwLock::new(SparseIndex::new(limits.index_granularity)),
            sealed: AtomicBool::new(false),
            mapped: Mutex::new(None),
            readers: Mutex::new(HashSet::new()),
            next_reader_id: AtomicU64::new(0),
        }))
    }

    /// Rebuilds the sparse index, committed length and last index by
    /// scanning every frame in the file.
    ///
    /// Tail policy: a partial or corrupt frame is benign only when
    /// `tolerate_tail` is set, i.e. for the last, still-open segment, where
    /// it means a crash tore the final append; the file is truncated back
    /// to the last intact frame. Anywhere else a bad frame is corruption
    /// and surfaces as [`StorageError::CorruptFrame`].
    pub fn recover<E: Entry>(&self, tolerate_tail: bool) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut data = vec![0u8; file_len as usize];
        self.file.read_exact_at(&mut data, 0)?;

        let mut index = self.index.write();
        *index = SparseIndex::new(self.limits.index_granularity);

        let mut offset = 0u64;
        let mut next_index = self.descriptor.base_index;

        while offset < file_len {
            match decode_frame::<E>(&data[offset as usize..], self.limits.max_entry_size) {
                FrameOutcome::Entry { len, .. } => {
                    index.record(next_index, offset);
                    offset += len as u64;
                    next_index += 1;
                }
                FrameOutcome::Partial | FrameOutcome::Corrupt => {
                    if !tolerate_tail {
                        return Err(StorageError::CorruptFrame {
                            segment_id: self.descriptor.id,
                            offset,
                        });
                    }
                    warn!(
                        "segment {}: discarding torn tail at offset {} ({} bytes)",
                        self.descriptor.id,
                        offset,
                        file_len - offset
                    );
                    self.file.set_len(offset)?;
                    break;
                }
            }
        }

        self.committed.store(offset, Ordering::Release);
        self.last_index.store(next_index - 1, Ordering::Release);

        info!(
            "recovered segment: id={}, base_index={}, entries={}, bytes={}",
            self.descriptor.id,
            self.descriptor.base_index,
            next_index - self.descriptor.base_index,
            offset
        );
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn base_index(&self) -> u64 {
        self.descriptor.base_index
    }

    pub fn path(&self) -> &PathBuf {
        &self.descriptor.path
    }

    pub(crate) fn limits(&self) -> SegmentLimits {
        self.limits
    }

    pub(crate) fn file_handle(&self) -> Arc<File> {
        self.file.clone()
    }

    /// Byte length covering only fully written frames.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Highest index held, or `base_index - 1` while empty.
    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.base_index()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Marks the segment read-only. Open readers stay valid.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
        info!(
            "sealed segment: id={}, entries={}, bytes={}",
            self.descriptor.id,
            self.last_index() + 1 - self.base_index(),
            self.committed()
        );
    }

    /// Makes a sealed segment writable again, used when truncation lands
    /// inside it and it must become the tail once more.
    pub(crate) fn reopen(&self) {
        self.sealed.store(false, Ordering::Release);
    }

    /// Nearest indexed position at or below `index`, falling back to the
    /// segment start.
    pub(crate) fn locate(&self, index: u64) -> Position {
        self.index.read().lookup(index).unwrap_or(Position {
            index: self.descriptor.base_index,
            offset: 0,
        })
    }

    /// Publishes one appended frame: index sample, committed length, then
    /// the last index. Called by the writer after the frame is fully on the
    /// file. The committed length is stored first so any thread that
    /// observes the new last index also finds the frame's bytes readable.
    pub(crate) fn record_append(&self, index: u64, offset: u64, len: u64) {
        self.index.write().record(index, offset);
        self.committed.store(offset + len, Ordering::Release);
        self.last_index.store(index, Ordering::Release);
    }

    /// Rewinds the segment so `index` becomes the next index to append:
    /// file, committed length, last index and sparse index together.
    pub(crate) fn truncate_from(&self, index: u64, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.file.sync_data()?;
        self.index.write().truncate(index);
        self.committed.store(offset, Ordering::Release);
        self.last_index.store(index - 1, Ordering::Release);
        // A cached map may still cover discarded bytes; readers re-derive
        // their bound from the committed length, so only drop the cache.
        *self.mapped.lock() = None;
        info!(
            "truncated segment: id={}, next_index={}, bytes={}",
            self.descriptor.id, index, offset
        );
        Ok(())
    }

    /// Length of the frame starting at `offset`, validated against the
    /// committed region. Used to walk frame boundaries without decoding.
    pub(crate) fn frame_len_at(&self, offset: u64) -> Result<u64> {
        let corrupt = || StorageError::CorruptFrame {
            segment_id: self.descriptor.id,
            offset,
        };
        let committed = self.committed();
        if offset + FRAME_HEADER_SIZE as u64 > committed {
            return Err(corrupt());
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.file.read_exact_at(&mut header, offset)?;
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let magic = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if magic != FRAME_MAGIC || len < FRAME_HEADER_SIZE as u64 || offset + len > committed {
            return Err(corrupt());
        }
        Ok(len)
    }

    /// Shared memory-mapped view of the file, remapped when appends have
    /// outgrown the cached one. All mapped readers of this segment share
    /// the same view.
    pub(crate) fn mapped_view(&self) -> Result<Arc<Mmap>> {
        let mut cached = self.mapped.lock();
        let committed = self.committed();
        if let Some(map) = cached.as_ref() {
            if map.len() as u64 >= committed {
                return Ok(map.clone());
            }
        }
        // Safety: the file is only ever extended by whole-frame appends and
        // readers bound themselves to the committed length, never the raw
        // mapping length.
        let map = Arc::new(unsafe { Mmap::map(&*self.file)? });
        *cached = Some(map.clone());
        Ok(map)
    }

    /// Registers a reader and returns its id. The registry holds ids only;
    /// readers own their own state and deregister on close.
    pub(crate) fn register_reader(&self) -> u64 {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        self.readers.lock().insert(id);
        id
    }

    pub(crate) fn close_reader(&self, id: u64) {
        self.readers.lock().remove(&id);
    }

    pub fn active_readers(&self) -> usize {
        self.readers.lock().len()
    }

    /// Removes the backing file. Readers still holding the handle keep
    /// draining from the unlinked file; the manager only calls this once no
    /// retained range needs the segment.
    pub fn delete(&self) -> Result<()> {
        std::fs::remove_file(&self.descriptor.path).map_err(|e| {
            warn!(
                "failed to delete segment file {:?}: {}",
                self.descriptor.path, e
            );
            e
        })?;
        info!(
            "deleted segment: id={}, base_index={}",
            self.descriptor.id, self.descriptor.base_index
        );
        Ok(())
    }
}
