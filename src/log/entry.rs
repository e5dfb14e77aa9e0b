use bincode::{Decode, Encode, config};
use tracing::warn;

use crate::error::{Result, StorageError};

/// Fixed marker in every frame header. A zeroed or garbage region of a
/// segment file never parses as a valid header.
pub const FRAME_MAGIC: u32 = 0x5347_4C31; // "SGL1"

/// Header layout: | len: u32 | kind: u32 | magic: u32 | crc: u32 |
pub const FRAME_HEADER_SIZE: usize = 16;

const FRAME_KIND_ENTRY: u32 = 1;

/// Payload types that can be stored in the log. The bincode bounds stand in
/// for the injectable serialization namespace: any derivable type works.
pub trait Entry: Encode + Decode<()> + Clone + Send + 'static {}

impl<T: Encode + Decode<()> + Clone + Send + 'static> Entry for T {}

/// A decoded entry paired with the index assigned to it at append time and
/// its on-disk frame size. The size lets cursors advance without re-parsing.
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Indexed<E> {
    pub index: u64,
    pub entry: E,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    len: u32,
    kind: u32,
    magic: u32,
    crc: u32,
}

impl FrameHeader {
    fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Self {
        debug_assert!(data.len() >= FRAME_HEADER_SIZE);
        Self {
            len: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            kind: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            magic: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            crc: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        }
    }
}

/// Outcome of decoding one frame from a byte region.
///
/// `Partial` and `Corrupt` are deliberately distinct from an error: whether
/// a bad frame is a benign crash-truncated tail or fatal corruption is a
/// policy decision made by the caller based on where the frame sits.
#[derive(Debug)]
pub enum FrameOutcome<E> {
    /// A complete, intact frame. `len` is the full frame length in bytes.
    Entry { entry: E, len: u32 },
    /// The region ends before a complete frame.
    Partial,
    /// A structurally complete frame failed its magic, kind, length-bound,
    /// checksum or payload-decode check.
    Corrupt,
}

/// Encodes a single entry into a self-delimiting frame.
///
/// Fails with [`StorageError::EntryTooLarge`] before any byte is produced
/// when the payload exceeds `max_entry_size`; the bound is what protects
/// readers from unbounded allocation on a corrupt length field.
pub fn encode_frame<E: Entry>(entry: &E, max_entry_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::encode_to_vec(entry, config::standard())?;
    if payload.len() > max_entry_size {
        return Err(StorageError::EntryTooLarge {
            size: payload.len(),
            limit: max_entry_size,
        });
    }

    let header = FrameHeader {
        len: (FRAME_HEADER_SIZE + payload.len()) as u32,
        kind: FRAME_KIND_ENTRY,
        magic: FRAME_MAGIC,
        crc: crc32fast::hash(&payload),
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes the frame at the start of `buf`.
///
/// `buf` may extend past the frame; the header's length field delimits it.
pub fn decode_frame<E: Entry>(buf: &[u8], max_entry_size: usize) -> FrameOutcome<E> {
    if buf.len() < FRAME_HEADER_SIZE {
        return FrameOutcome::Partial;
    }

    let header = FrameHeader::from_bytes(buf);
    if header.magic != FRAME_MAGIC || header.kind != FRAME_KIND_ENTRY {
        return FrameOutcome::Corrupt;
    }

    let len = header.len as usize;
    if len < FRAME_HEADER_SIZE || len - FRAME_HEADER_SIZE > max_entry_size {
        return FrameOutcome::Corrupt;
    }
    if buf.len() < len {
        return FrameOutcome::Partial;
    }

    let payload = &buf[FRAME_HEADER_SIZE..len];
    if crc32fast::hash(payload) != header.crc {
        return FrameOutcome::Corrupt;
    }

    match bincode::decode_from_slice(payload, config::standard()) {
        Ok((entry, _)) => FrameOutcome::Entry {
            entry,
            len: header.len,
        },
        Err(e) => {
            warn!("frame checksum valid but payload failed to decode: {}", e);
            FrameOutcome::Corrupt
        }
    }
}
