use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    error::{Result, StorageError},
    service::SnapshotService,
};

use super::{
    entry::{Entry, Indexed},
    reader::SegmentReader,
    segment::{LogSegment, SegmentDescriptor, SegmentLimits},
    writer::SegmentWriter,
};

/// Default maximum segment size (64MB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default maximum encoded entry size (1MB).
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 1024 * 1024;

const SEGMENT_FILE_PREFIX: &str = "segment-";
const SEGMENT_FILE_EXT: &str = ".log";

/// Configuration for a [`LogManager`].
#[derive(Clone, Debug)]
pub struct LogManagerOptions {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rollover.
    pub max_segment_size: u64,
    /// Maximum encoded size of a single entry.
    pub max_entry_size: usize,
    /// Record one sparse index sample per this many entries.
    pub index_granularity: u64,
    /// Whether to fsync after every append.
    pub flush_on_append: bool,
}

impl Default for LogManagerOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            index_granularity: 16,
            flush_on_append: true,
        }
    }
}

struct TailState<E: Entry> {
    writer: SegmentWriter<E>,
    next_segment_id: u64,
}

/// Owner of the ordered segment collection.
///
/// The manager routes appends to the tail segment's writer, rolls to a new
/// segment when the tail fills, locates the right segment for a read by
/// binary search over base indices, and applies truncation (discard suffix)
/// and compaction (discard prefix). Structural mutations serialize on the
/// tail lock; reads on unaffected segments proceed concurrently.
///
/// Indices are one-based, strictly increasing, assigned exactly once at
/// append time. The consensus layer above guarantees only one call site
/// appends at a time; the manager guarantees only one writer object exists.
pub struct LogManager<E: Entry> {
    options: LogManagerOptions,
    limits: SegmentLimits,
    segments: RwLock<BTreeMap<u64, Arc<LogSegment>>>,
    tail: Mutex<TailState<E>>,
}

impl<E: Entry> LogManager<E> {
    /// Opens the log in `options.dir`, recovering any existing segments.
    ///
    /// Every segment but the last is opened read-only under the strict tail
    /// policy: a bad frame there is corruption, not crash truncation. The
    /// last segment tolerates (and trims) a torn tail, then becomes the
    /// write target again.
    pub fn open(options: LogManagerOptions) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;
        let limits = SegmentLimits {
            max_segment_size: options.max_segment_size,
            max_entry_size: options.max_entry_size,
            index_granularity: options.index_granularity,
        };

        let mut files: Vec<(u64, u64, PathBuf)> = Vec::new();
        for dirent in fs::read_dir(&options.dir)? {
            let path = dirent?.path();
            if let Some((id, base)) = parse_segment_file_name(&path) {
                files.push((id, base, path));
            }
        }
        files.sort_by_key(|(id, base, _)| (*base, *id));

        let mut segments = BTreeMap::new();
        let mut next_segment_id = 0;
        let count = files.len();
        for (i, (id, base, path)) in files.into_iter().enumerate() {
            let is_tail = i + 1 == count;
            let segment = LogSegment::create(
                SegmentDescriptor {
                    id,
                    base_index: base,
                    path,
                },
                limits,
            )?;
            segment.recover::<E>(is_tail)?;
            if !is_tail {
                segment.seal();
            }
            segments.insert(base, segment);
            next_segment_id = id + 1;
        }

        if segments.is_empty() {
            let segment = Self::new_segment(&options.dir, limits, 0, 1)?;
            segments.insert(1, segment);
            next_segment_id = 1;
        }

        let tail_segment = segments.values().next_back().unwrap().clone();
        let writer = SegmentWriter::new(tail_segment);

        info!(
            "opened log: dir={:?}, segments={}, next_index={}",
            options.dir,
            segments.len(),
            writer.next_index()
        );

        Ok(Self {
            options,
            limits,
            segments: RwLock::new(segments),
            tail: Mutex::new(TailState {
                writer,
                next_segment_id,
            }),
        })
    }

    fn new_segment(
        dir: &PathBuf,
        limits: SegmentLimits,
        id: u64,
        base_index: u64,
    ) -> Result<Arc<LogSegment>> {
        let path = dir.join(format!(
            "{}{:010}-{:020}{}",
            SEGMENT_FILE_PREFIX, id, base_index, SEGMENT_FILE_EXT
        ));
        LogSegment::create(
            SegmentDescriptor {
                id,
                base_index,
                path,
            },
            limits,
        )
    }

    /// Appends one entry to the tail segment, rolling to a new segment
    /// first if the tail is full. Returns the committed, positioned entry.
    pub fn append(&self, entry: E) -> Result<Indexed<E>> {
        let mut tail = self.tail.lock();
        let indexed = match tail.writer.append(&entry) {
            Ok(indexed) => indexed,
            Err(StorageError::SegmentFull { .. }) => {
                self.roll(&mut tail)?;
                tail.writer.append(&entry)?
            }
            Err(e) => return Err(e),
        };
        if self.options.flush_on_append {
            tail.writer.flush()?;
        }
        Ok(indexed)
    }

    /// Seals the tail segment (its readers stay valid) and opens a fresh
    /// one whose base index is one past the sealed segment's last index.
    fn roll(&self, tail: &mut TailState<E>) -> Result<()> {
        tail.writer.flush()?;
        tail.writer.segment().seal();

        let base = tail.writer.next_index();
        let id = tail.next_segment_id;
        let segment = Self::new_segment(&self.options.dir, self.limits, id, base)?;

        self.segments.write().insert(base, segment.clone());
        tail.writer = SegmentWriter::new(segment);
        tail.next_segment_id = id + 1;
        Ok(())
    }

    /// Forces everything appended so far onto durable storage.
    pub fn flush(&self) -> Result<()> {
        self.tail.lock().writer.flush()
    }

    /// Opens a reader positioned so its next entry has `index`. Used both
    /// for single reads and for bulk catch-up of a lagging peer; the caller
    /// may switch it between file and mapped access freely.
    pub fn reader_at(&self, index: u64) -> Result<SegmentReader<E>> {
        let segments = self.segments.read();
        let (first, last) = retained_range(&segments);
        if index < first || index > last {
            return Err(StorageError::InvalidIndex {
                index,
                first_index: first,
                last_index: last,
            });
        }
        let (_, segment) = segments.range(..=index).next_back().ok_or(
            StorageError::InvalidIndex {
                index,
                first_index: first,
                last_index: last,
            },
        )?;
        let mut reader = SegmentReader::new(segment.clone());
        drop(segments);
        reader.reset_to(index)?;
        Ok(reader)
    }

    /// Reads the single entry at `index`.
    pub fn read(&self, index: u64) -> Result<Indexed<E>> {
        let mut reader = self.reader_at(index)?;
        match reader.next()? {
            Some(entry) => Ok(entry),
            // The segment was truncated between routing and the read.
            None => {
                let segments = self.segments.read();
                let (first, last) = retained_range(&segments);
                Err(StorageError::InvalidIndex {
                    index,
                    first_index: first,
                    last_index: last,
                })
            }
        }
    }

    /// Discards all entries with index `>= index`, deleting whole segments
    /// past the cutoff and rewinding the surviving one. Used when entries
    /// from an abandoned leadership term must be erased.
    ///
    /// Refuses to cut below the retained first index: everything below it
    /// is already covered by a snapshot. Truncating at or past the next
    /// index is a no-op.
    pub fn truncate(&self, index: u64) -> Result<()> {
        let mut tail = self.tail.lock();
        let mut segments = self.segments.write();
        let (first, last) = retained_range(&segments);
        if index < first {
            return Err(StorageError::InvalidIndex {
                index,
                first_index: first,
                last_index: last,
            });
        }
        if index >= tail.writer.next_index() {
            return Ok(());
        }

        while segments.len() > 1 {
            let (&base, _) = segments.iter().next_back().unwrap();
            if base < index {
                break;
            }
            let segment = segments.remove(&base).unwrap();
            segment.delete()?;
        }

        let survivor = segments.values().next_back().unwrap().clone();
        drop(segments);

        survivor.reopen();
        let mut writer = SegmentWriter::new(survivor);
        writer.truncate(index)?;
        tail.writer = writer;

        info!("truncated log: next_index={}", index);
        Ok(())
    }

    /// Discards log prefix made obsolete by a durable snapshot at `index`:
    /// deletes sealed segments whose entire range is below `index` and
    /// which have no open readers. A segment still serving readers is
    /// retained and picked up by a later compaction; the segment containing
    /// `index` is never touched. Returns the number of segments deleted.
    pub fn compact(&self, index: u64) -> Result<usize> {
        // Hold the tail lock so compaction, truncation and rollover are
        // mutually exclusive; reads on retained segments are unaffected.
        let _tail = self.tail.lock();
        let mut segments = self.segments.write();
        let mut removed = 0usize;

        loop {
            let (base, deletable) = match segments.iter().next() {
                Some((&base, segment))
                    if segments.len() > 1
                        && segment.is_sealed()
                        && segment.last_index() < index =>
                {
                    (base, segment.active_readers() == 0)
                }
                _ => break,
            };
            if !deletable {
                debug!(
                    "compaction keeping segment with open readers: base_index={}",
                    base
                );
                break;
            }
            let segment = segments.remove(&base).unwrap();
            segment.delete()?;
            removed += 1;
        }

        if removed > 0 {
            info!("compacted log: snapshot_index={}, removed={}", index, removed);
        }
        Ok(removed)
    }

    /// Applies entries from `from_index` onward to `service` in strict
    /// index order, crossing segment boundaries as needed. Returns the next
    /// index to apply; this is the catch-up path after a snapshot restore.
    pub fn replay_into<S>(&self, service: &mut S, from_index: u64) -> Result<u64>
    where
        S: SnapshotService<Command = E>,
    {
        let last = self.last_index();
        if from_index > last {
            return Ok(from_index);
        }

        let mut next = from_index;
        loop {
            let mut reader = self.reader_at(next)?;
            while let Some(entry) = reader.next()? {
                service.apply(&entry)?;
                next = entry.index + 1;
            }
            if next > last {
                return Ok(next);
            }
            // Reached the end of one segment; continue in the next.
        }
    }

    /// First retained index (1 on a fresh log).
    pub fn first_index(&self) -> u64 {
        retained_range(&self.segments.read()).0
    }

    /// Highest appended index, or `first_index - 1` when empty.
    pub fn last_index(&self) -> u64 {
        retained_range(&self.segments.read()).1
    }

    /// Index the next appended entry will be assigned.
    pub fn next_index(&self) -> u64 {
        self.last_index() + 1
    }

    pub fn is_empty(&self) -> bool {
        let (first, last) = retained_range(&self.segments.read());
        last < first
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Total bytes of committed frames across all segments.
    pub fn size(&self) -> u64 {
        self.segments.read().values().map(|s| s.committed()).sum()
    }
}

fn retained_range(segments: &BTreeMap<u64, Arc<LogSegment>>) -> (u64, u64) {
    let first = segments.keys().next().copied().unwrap_or(1);
    let last = segments
        .values()
        .next_back()
        .map(|s| s.last_index())
        .unwrap_or(first - 1);
    (first, last)
}

fn parse_segment_file_name(path: &PathBuf) -> Option<(u64, u64)> {
    let name = path.file_name()?.to_str()?;
    let middle = name
        .strip_prefix(SEGMENT_FILE_PREFIX)?
        .strip_suffix(SEGMENT_FILE_EXT)?;
    let (id, base) = middle.split_once('-')?;
    let base: u64 = base.parse().ok()?;
    // Indices are one-based; a zero base cannot come from this crate, so
    // such a file is foreign and is left alone.
    if base == 0 {
        return None;
    }
    Some((id.parse().ok()?, base))
}
