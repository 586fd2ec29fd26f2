//! On-disk layout of an Etch file.
//!
//! ```text
//! offset 0   [2B magic][2B version][8B data length][32B root hash]
//! offset 44  level-0 index block: 65536 x 8B slots
//! ...        data records and deeper index blocks, appended in write order
//! ```
//!
//! All multi-byte integers are big-endian.

use etch_types::{Flags, Hash};

use crate::error::{EtchError, EtchResult};

pub const MAGIC_NUMBER: u16 = 0xE7C4;
pub const FORMAT_VERSION: u16 = 1;

pub const HEADER_SIZE: usize = 44;
pub(crate) const OFFSET_MAGIC: usize = 0;
pub(crate) const OFFSET_VERSION: usize = 2;
pub(crate) const OFFSET_DATA_LENGTH: usize = 4;
pub(crate) const OFFSET_ROOT_HASH: usize = 12;

/// File position of the level-0 index block.
pub const INDEX_START: u64 = HEADER_SIZE as u64;

pub const SLOT_SIZE: usize = 8;

/// Depth bound on radix descent: levels 0 and 1 consume three key bytes, each
/// deeper level one nibble of the remaining 29.
pub const MAX_LEVEL: usize = 60;

pub const KEY_SIZE: usize = Hash::LENGTH;
pub(crate) const RECORD_OFFSET_FLAGS: usize = KEY_SIZE;
pub(crate) const RECORD_OFFSET_MEMORY_SIZE: usize = KEY_SIZE + 1;
pub(crate) const RECORD_OFFSET_LENGTH: usize = KEY_SIZE + 9;
/// Key + flags + size metadata + payload length.
pub const RECORD_HEADER_SIZE: usize = KEY_SIZE + 11;
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;
pub const MAX_RECORD_SIZE: usize = RECORD_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Largest span one region may map before the next region takes over.
pub const MAX_REGION_SIZE: usize = 1 << 30;
/// Extra bytes mapped past a region's nominal end so a bounded read or write
/// that starts inside the region never has to cross into the next one.
pub const REGION_MARGIN: usize = 1 << 20;

const TYPE_SHIFT: u32 = 62;
const OFFSET_MASK: u64 = (1 << TYPE_SHIFT) - 1;

/// Number of slots in an index block at `level`.
pub const fn index_size(level: usize) -> usize {
    match level {
        0 => 65536,
        1 => 256,
        _ => 16,
    }
}

/// Byte length of an index block at `level`.
pub const fn index_block_len(level: usize) -> usize {
    index_size(level) * SLOT_SIZE
}

/// Smallest valid data length: header plus the level-0 index.
pub const MIN_DATA_LENGTH: u64 = INDEX_START + index_block_len(0) as u64;

/// The radix digit of `key` at `level`.
///
/// Level 0 uses the first two bytes, level 1 the third byte, and every level
/// after that alternates high and low nibbles of the bytes that follow.
pub fn digit(key: &Hash, level: usize) -> usize {
    let k = key.as_bytes();
    match level {
        0 => u16::from_be_bytes([k[0], k[1]]) as usize,
        1 => k[2] as usize,
        _ => {
            let n = level - 2;
            let b = k[3 + n / 2];
            if n % 2 == 0 {
                (b >> 4) as usize
            } else {
                (b & 0x0F) as usize
            }
        }
    }
}

/// What a slot points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// A single data record.
    Plain = 0,
    /// A child index block one level down.
    Index = 1,
    /// The first record of a collision chain.
    ChainHead = 2,
    /// A later record of a collision chain.
    ChainContinuation = 3,
}

/// An 8-byte tagged pointer: 2 type bits over a 62-bit file offset.
///
/// The raw value 0 is the empty slot; offset 0 is inside the header, so no
/// real pointer encodes to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(u64);

impl Slot {
    pub const EMPTY: Slot = Slot(0);

    pub fn new(kind: SlotKind, offset: u64) -> Self {
        debug_assert!(offset != 0 && offset <= OFFSET_MASK);
        Self(((kind as u64) << TYPE_SHIFT) | (offset & OFFSET_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The slot type. Meaningless for the empty slot.
    pub fn kind(self) -> SlotKind {
        match self.0 >> TYPE_SHIFT {
            0 => SlotKind::Plain,
            1 => SlotKind::Index,
            2 => SlotKind::ChainHead,
            _ => SlotKind::ChainContinuation,
        }
    }

    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Same target, different type.
    pub fn with_kind(self, kind: SlotKind) -> Self {
        Self::new(kind, self.offset())
    }

    /// Whether the slot refers to a data record (as opposed to an index block).
    pub fn is_value(self) -> bool {
        !self.is_empty() && self.kind() != SlotKind::Index
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Slot(empty)")
        } else {
            write!(f, "Slot({:?} @ {})", self.kind(), self.offset())
        }
    }
}

/// A value as held in a data record: flags, size metadata, and an opaque
/// payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub flags: Flags,
    /// Caller-defined size metadata (the in-memory footprint of the decoded
    /// value). Zero means "not yet known".
    pub memory_size: u64,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(flags: Flags, memory_size: u64, payload: Vec<u8>) -> Self {
        Self {
            flags,
            memory_size,
            payload,
        }
    }

    /// Bytes this record occupies on disk.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    /// Encode with its key, ready to append.
    pub(crate) fn encode(&self, key: &Hash) -> EtchResult<Vec<u8>> {
        let len = self.payload.len();
        if len == 0 {
            return Err(EtchError::EmptyPayload(*key));
        }
        if len > MAX_PAYLOAD_SIZE {
            return Err(EtchError::PayloadTooLarge(len));
        }
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + len);
        buf.extend_from_slice(key.as_bytes());
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.memory_size.to_be_bytes());
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Decoded fixed-size part of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub key: Hash,
    pub flags: Flags,
    pub memory_size: u64,
    pub length: usize,
}

impl RecordHeader {
    pub fn decode(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&buf[..KEY_SIZE]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[RECORD_OFFSET_MEMORY_SIZE..RECORD_OFFSET_LENGTH]);
        Self {
            key: Hash::from_bytes(key),
            flags: Flags::from_bits(buf[RECORD_OFFSET_FLAGS]),
            memory_size: u64::from_be_bytes(size),
            length: u16::from_be_bytes([
                buf[RECORD_OFFSET_LENGTH],
                buf[RECORD_OFFSET_LENGTH + 1],
            ]) as usize,
        }
    }
}

/// The file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u16,
    pub version: u16,
    pub data_length: u64,
    pub root_hash: Hash,
}

impl Header {
    pub fn new(data_length: u64) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: FORMAT_VERSION,
            data_length,
            root_hash: Hash::ZERO,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[OFFSET_MAGIC..OFFSET_VERSION].copy_from_slice(&self.magic.to_be_bytes());
        buf[OFFSET_VERSION..OFFSET_DATA_LENGTH].copy_from_slice(&self.version.to_be_bytes());
        buf[OFFSET_DATA_LENGTH..OFFSET_ROOT_HASH].copy_from_slice(&self.data_length.to_be_bytes());
        buf[OFFSET_ROOT_HASH..].copy_from_slice(self.root_hash.as_bytes());
        buf
    }

    /// Decode and validate magic and version.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> EtchResult<Self> {
        let magic = u16::from_be_bytes([buf[OFFSET_MAGIC], buf[OFFSET_MAGIC + 1]]);
        if magic != MAGIC_NUMBER {
            return Err(EtchError::InvalidHeader {
                expected: MAGIC_NUMBER,
                actual: magic,
            });
        }
        let version = u16::from_be_bytes([buf[OFFSET_VERSION], buf[OFFSET_VERSION + 1]]);
        if version != FORMAT_VERSION {
            return Err(EtchError::UnsupportedVersion(version));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[OFFSET_DATA_LENGTH..OFFSET_ROOT_HASH]);
        let mut root = [0u8; KEY_SIZE];
        root.copy_from_slice(&buf[OFFSET_ROOT_HASH..]);
        Ok(Self {
            magic,
            version,
            data_length: u64::from_be_bytes(len),
            root_hash: Hash::from_bytes(root),
        })
    }
}
