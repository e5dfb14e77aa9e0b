use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage-layer error taxonomy.
///
/// No failure is retried internally; every error is surfaced to the caller
/// immediately so the replication layer above can make a globally consistent
/// decision (step down, resync from a peer, abort).
#[derive(Debug, Error)]
pub enum StorageError {
    /// An underlying file or mapping operation failed. Fatal to the current
    /// operation; resource cleanup still runs while this propagates.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The encoded entry exceeds the configured maximum entry size. Raised
    /// before any byte is written.
    #[error("entry of {size} bytes exceeds maximum entry size {limit}")]
    EntryTooLarge { size: usize, limit: usize },

    /// A frame inside the committed region of a segment failed validation.
    /// A torn tail on the open segment is repaired during recovery; this
    /// variant always means real corruption.
    #[error("corrupt frame in segment {segment_id} at offset {offset}")]
    CorruptFrame { segment_id: u64, offset: u64 },

    /// The requested index lies outside the retained range, e.g. because it
    /// was compacted away or never appended. Recoverable: the caller falls
    /// back to shipping a snapshot instead.
    #[error("index {index} outside retained range [{first_index}, {last_index}]")]
    InvalidIndex {
        index: u64,
        first_index: u64,
        last_index: u64,
    },

    /// The segment cannot hold another frame; the caller must roll to a new
    /// segment and retry.
    #[error("segment {segment_id} is full")]
    SegmentFull { segment_id: u64 },

    #[error("failed to encode entry: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// A snapshot stream could not be decoded back into service state.
    #[error("snapshot stream corrupt or truncated: {0}")]
    CorruptSnapshot(#[source] bincode::error::DecodeError),
}
