//! The radix-tree engine.
//!
//! Keys descend through index blocks one digit per level (see
//! [`digit`](crate::format::digit)). A slot holds a single record, a pointer
//! to a child block, or one member of a collision chain: a run of adjacent
//! slots (wrapping modulo the block size) made of one chain head followed by
//! chain continuations, all holding keys with the head's digit.
//!
//! Records and index blocks are only ever appended. Mutation is limited to
//! rewriting slots and upgrading a record's flags and size metadata.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use etch_types::{Flags, Hash};
use fs2::FileExt;
use tempfile::TempPath;
use tracing::{debug, error, info, warn};

use crate::config::EtchConfig;
use crate::error::{EtchError, EtchResult};
use crate::format::{
    digit, index_block_len, index_size, Header, Record, RecordHeader, Slot, SlotKind,
    HEADER_SIZE, INDEX_START, MAX_LEVEL, MIN_DATA_LENGTH, OFFSET_DATA_LENGTH, OFFSET_ROOT_HASH,
    RECORD_HEADER_SIZE, RECORD_OFFSET_FLAGS, RECORD_OFFSET_MEMORY_SIZE, SLOT_SIZE,
};
use crate::region::RegionManager;

/// Outcome of a [`Etch::write`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// File offset of the key's data record.
    pub offset: u64,
    /// `true` if a new record was appended, `false` if an existing one was
    /// updated in place.
    pub created: bool,
    /// Flags after merging.
    pub flags: Flags,
    /// Size metadata after merging.
    pub memory_size: u64,
}

/// Where the record for an insertion comes from.
#[derive(Clone, Copy)]
enum Source<'a> {
    /// Append this record.
    New(&'a Record),
    /// Re-link a record already in the file (chain collapse, slot split).
    Existing(u64),
}

enum Lookup {
    Found(u64),
    Missing,
    /// The chain being scanned was collapsed mid-scan.
    Moved,
}

#[derive(Clone, Copy)]
struct Placement {
    offset: u64,
    created: bool,
}

/// Result of comparing a lookup key against the key stored in a record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyMatch {
    pub matched: bool,
    pub stored: Hash,
}

/// An Etch store: a single memory-mapped file holding a radix-indexed set of
/// immutable records keyed by 32-byte hashes.
///
/// One writer at a time (serialized internally), any number of concurrent
/// readers. The file is held under an exclusive advisory lock until
/// [`close`](Etch::close) or drop.
pub struct Etch {
    path: PathBuf,
    config: EtchConfig,
    regions: RegionManager,
    /// Held for the whole descent of one write.
    write_lock: Mutex<()>,
    /// High-water mark: everything below it is header, index, or records.
    data_length: AtomicU64,
    closed: AtomicBool,
    poisoned: AtomicBool,
    /// Set for stores created by [`Etch::create_temp`]; deletes the file on
    /// drop, after `regions` has released it.
    temp: Option<TempPath>,
}

impl Etch {
    /// Open or create an Etch file with default configuration.
    pub fn open(path: impl AsRef<Path>) -> EtchResult<Self> {
        Self::open_with(path, EtchConfig::default())
    }

    /// Open or create an Etch file.
    ///
    /// An empty or missing file is initialised with a fresh header and level-0
    /// index. An existing file must carry a valid header and a data length
    /// that fits inside it.
    pub fn open_with(path: impl AsRef<Path>, config: EtchConfig) -> EtchResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|e| EtchError::Locked(format!("{}: {e}", path.display())))?;

        let file_len = file.metadata()?.len();
        let header = if file_len == 0 {
            None
        } else {
            Some(read_header(&file, file_len)?)
        };

        let regions = RegionManager::new(file, config.normalized_region_size());
        let data_length = match header {
            Some(h) => h.data_length,
            None => {
                let fresh = Header::new(MIN_DATA_LENGTH);
                regions.map_at(0, HEADER_SIZE)?.write(0, &fresh.encode());
                // The fresh mapping is zero-filled, which is an empty index.
                regions.map_at(INDEX_START, index_block_len(0))?;
                MIN_DATA_LENGTH
            }
        };

        info!(
            path = %path.display(),
            data_length,
            created = header.is_none(),
            "opened Etch store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            config,
            regions,
            write_lock: Mutex::new(()),
            data_length: AtomicU64::new(data_length),
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            temp: None,
        })
    }

    /// Create a store on a fresh temporary file, deleted when the store is
    /// dropped.
    pub fn create_temp() -> EtchResult<Self> {
        Self::create_temp_with(EtchConfig::default())
    }

    pub fn create_temp_with(config: EtchConfig) -> EtchResult<Self> {
        let temp = tempfile::Builder::new()
            .prefix("etch-")
            .suffix(".etch")
            .tempfile()?
            .into_temp_path();
        let mut etch = Self::open_with(&temp, config)?;
        etch.temp = Some(temp);
        Ok(etch)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EtchConfig {
        &self.config
    }

    /// Current high-water mark of the file.
    pub fn data_length(&self) -> u64 {
        self.data_length.load(Ordering::Acquire)
    }

    /// Physical length of the backing file, which includes the unused tail of
    /// the last mapped region while the store is open.
    pub fn physical_length(&self) -> EtchResult<u64> {
        self.regions.physical_length()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------
    // Public key-value operations
    // ---------------------------------------------------------------

    /// Store `record` under `key`.
    ///
    /// If the key is already present its payload is left untouched: the
    /// stored flags are merged with `record.flags` and the size metadata is
    /// filled in if it was still zero.
    pub fn write(&self, key: &Hash, record: &Record) -> EtchResult<WriteResult> {
        self.ensure_open()?;
        // Validate before touching the file.
        if let Err(e) = record.encode(key) {
            self.poison_on_fatal(&e);
            return Err(e);
        }

        let _guard = self.lock_writer();
        self.ensure_open()?;
        let result = self
            .write_entry(key, Source::New(record), INDEX_START, 0)
            .and_then(|placed| {
                let head = self.record_header(placed.offset)?;
                Ok(WriteResult {
                    offset: placed.offset,
                    created: placed.created,
                    flags: head.flags,
                    memory_size: head.memory_size,
                })
            });
        if let Err(e) = &result {
            self.poison_on_fatal(e);
        }
        result
    }

    /// Like [`write`](Etch::write), for a key given as a raw byte slice.
    pub fn write_raw(&self, key: &[u8], record: &Record) -> EtchResult<WriteResult> {
        let key = Hash::from_slice(key).map_err(|_| EtchError::InvalidKeyLength(key.len()))?;
        self.write(&key, record)
    }

    /// Look up the record stored under `key`.
    pub fn read(&self, key: &Hash) -> EtchResult<Option<Record>> {
        match self.locate(key)? {
            Some(offset) => Ok(Some(self.read_at(offset)?.1)),
            None => Ok(None),
        }
    }

    /// Whether `key` has a record.
    pub fn contains(&self, key: &Hash) -> EtchResult<bool> {
        Ok(self.locate(key)?.is_some())
    }

    /// File offset of `key`'s record, if present.
    pub fn locate(&self, key: &Hash) -> EtchResult<Option<u64>> {
        self.ensure_readable()?;
        loop {
            match self.descend(key)? {
                Lookup::Found(offset) => return Ok(Some(offset)),
                Lookup::Missing => return Ok(None),
                Lookup::Moved => continue,
            }
        }
    }

    fn descend(&self, key: &Hash) -> EtchResult<Lookup> {
        let mut block = INDEX_START;
        for level in 0..MAX_LEVEL {
            let size = index_size(level);
            let d = digit(key, level);
            let slot = self.read_slot(block, d)?;
            if slot.is_empty() {
                return Ok(Lookup::Missing);
            }
            match slot.kind() {
                SlotKind::Index => {
                    block = slot.offset();
                    self.check_index_block(block, level + 1)?;
                }
                SlotKind::Plain => {
                    return Ok(if self.compare_key(slot.offset(), key)?.matched {
                        Lookup::Found(slot.offset())
                    } else {
                        Lookup::Missing
                    });
                }
                // Continuations are only reached through their head.
                SlotKind::ChainContinuation => return Ok(Lookup::Missing),
                SlotKind::ChainHead => {
                    if self.compare_key(slot.offset(), key)?.matched {
                        return Ok(Lookup::Found(slot.offset()));
                    }
                    for i in 1..size {
                        let s = self.read_slot(block, (d + i) % size)?;
                        if s.is_empty() || s.kind() != SlotKind::ChainContinuation {
                            break;
                        }
                        if self.compare_key(s.offset(), key)?.matched {
                            return Ok(Lookup::Found(s.offset()));
                        }
                    }
                    // A concurrent collapse repoints the head before clearing
                    // the chain.
                    if self.read_slot(block, d)? != slot {
                        return Ok(Lookup::Moved);
                    }
                    return Ok(Lookup::Missing);
                }
            }
        }
        Err(EtchError::MaxLevelExceeded(*key))
    }

    /// Read the record at a known file offset, returning its key too.
    pub fn read_at(&self, offset: u64) -> EtchResult<(Hash, Record)> {
        self.ensure_readable()?;
        let head = self.record_header(offset)?;
        if head.length == 0 {
            return Err(EtchError::corruption(offset, "zero-length record"));
        }
        let mut payload = vec![0u8; head.length];
        self.regions
            .map_at(offset + RECORD_HEADER_SIZE as u64, head.length)?
            .read(0, &mut payload);
        Ok((
            head.key,
            Record::new(head.flags, head.memory_size, payload),
        ))
    }

    // ---------------------------------------------------------------
    // Root hash and lifecycle
    // ---------------------------------------------------------------

    /// The root hash recorded in the header. All zeros if never set.
    pub fn root_hash(&self) -> EtchResult<Hash> {
        self.ensure_readable()?;
        let mut buf = [0u8; Hash::LENGTH];
        self.regions
            .map_at(OFFSET_ROOT_HASH as u64, Hash::LENGTH)?
            .read(0, &mut buf);
        Ok(Hash::from_bytes(buf))
    }

    /// Replace the root hash. Durable after the next [`flush`](Etch::flush).
    pub fn set_root_hash(&self, hash: &Hash) -> EtchResult<()> {
        self.ensure_open()?;
        let _guard = self.lock_writer();
        self.ensure_open()?;
        self.regions
            .map_at(OFFSET_ROOT_HASH as u64, Hash::LENGTH)?
            .write(0, hash.as_bytes());
        debug!(root = %hash.short_hex(), "set root hash");
        Ok(())
    }

    /// Write back mapped data, then the header's data length.
    pub fn flush(&self) -> EtchResult<()> {
        self.ensure_open()?;
        let _guard = self.lock_writer();
        self.ensure_open()?;
        self.flush_locked()
    }

    fn flush_locked(&self) -> EtchResult<()> {
        if self.config.sync_on_flush {
            self.regions.flush_all()?;
        }
        let length = self.data_length();
        self.regions
            .map_at(OFFSET_DATA_LENGTH as u64, 8)?
            .write_u64(0, length);
        if self.config.sync_on_flush {
            self.regions.flush_range(0, HEADER_SIZE)?;
        }
        debug!(data_length = length, "flushed Etch store");
        Ok(())
    }

    /// Flush, release the mappings and the file lock. Idempotent.
    ///
    /// The header is rewritten even on a poisoned store: slots written since
    /// the last flush are already in the file, and the data length covers
    /// every record and block they can point at.
    pub fn close(&self) -> EtchResult<()> {
        let _guard = self.lock_writer();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let flushed = self.flush_locked();
        self.closed.store(true, Ordering::Release);
        self.regions.unmap_all();

        let file = self.regions.file();
        let length = self.data_length();
        if self.config.truncate_on_close && flushed.is_ok() {
            file.set_len(length)?;
        }
        file.sync_all()?;
        FileExt::unlock(file)?;
        info!(path = %self.path.display(), data_length = length, "closed Etch store");
        flushed
    }

    // ---------------------------------------------------------------
    // Guards
    // ---------------------------------------------------------------

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        // The guarded state lives in the file; a panic mid-write is caught
        // by the poisoned flag, not by the mutex.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn ensure_readable(&self) -> EtchResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EtchError::Closed);
        }
        Ok(())
    }

    fn ensure_open(&self) -> EtchResult<()> {
        self.ensure_readable()?;
        if self.poisoned.load(Ordering::Acquire) {
            return Err(EtchError::Poisoned);
        }
        Ok(())
    }

    fn poison_on_fatal(&self, e: &EtchError) {
        if e.is_fatal() {
            error!(path = %self.path.display(), error = %e, "fatal Etch error; store is now unusable");
            self.poisoned.store(true, Ordering::Release);
        }
    }

    // ---------------------------------------------------------------
    // Low-level slot and record access
    // ---------------------------------------------------------------

    pub(crate) fn read_slot(&self, block: u64, digit: usize) -> EtchResult<Slot> {
        let view = self
            .regions
            .map_at(block + (digit * SLOT_SIZE) as u64, SLOT_SIZE)?;
        let slot = Slot::from_raw(view.read_u64(0));
        fence(Ordering::Acquire);
        Ok(slot)
    }

    /// Every slot of the index block at `offset`.
    pub(crate) fn read_block(&self, offset: u64, level: usize) -> EtchResult<Vec<Slot>> {
        let mut buf = vec![0u8; index_block_len(level)];
        self.regions.map_at(offset, buf.len())?.read(0, &mut buf);
        fence(Ordering::Acquire);
        Ok(buf
            .chunks_exact(SLOT_SIZE)
            .map(|c| {
                let mut raw = [0u8; SLOT_SIZE];
                raw.copy_from_slice(c);
                Slot::from_raw(u64::from_be_bytes(raw))
            })
            .collect())
    }

    fn write_slot(&self, block: u64, digit: usize, slot: Slot) -> EtchResult<()> {
        let view = self
            .regions
            .map_at(block + (digit * SLOT_SIZE) as u64, SLOT_SIZE)?;
        // Record and child block bytes must land before the pointer to them.
        fence(Ordering::Release);
        view.write_u64(0, slot.raw());
        Ok(())
    }

    /// Check that an index block at `offset` lies inside written data.
    pub(crate) fn check_index_block(&self, offset: u64, level: usize) -> EtchResult<()> {
        if level >= MAX_LEVEL {
            return Err(EtchError::corruption(offset, "index block below deepest level"));
        }
        let end = offset + index_block_len(level) as u64;
        if offset < MIN_DATA_LENGTH || end > self.data_length() {
            return Err(EtchError::corruption(
                offset,
                format!("index block for level {level} outside data"),
            ));
        }
        Ok(())
    }

    pub(crate) fn record_header(&self, offset: u64) -> EtchResult<RecordHeader> {
        let limit = self.data_length();
        if offset < MIN_DATA_LENGTH || offset + RECORD_HEADER_SIZE as u64 > limit {
            return Err(EtchError::corruption(offset, "record pointer outside data"));
        }
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        self.regions
            .map_at(offset, RECORD_HEADER_SIZE)?
            .read(0, &mut buf);
        let head = RecordHeader::decode(&buf);
        if offset + (RECORD_HEADER_SIZE + head.length) as u64 > limit {
            return Err(EtchError::corruption(offset, "record payload runs past data"));
        }
        Ok(head)
    }

    pub(crate) fn compare_key(&self, offset: u64, key: &Hash) -> EtchResult<KeyMatch> {
        let stored = self.record_header(offset)?.key;
        Ok(KeyMatch {
            matched: stored == *key,
            stored,
        })
    }

    fn set_data_length(&self, length: u64) -> EtchResult<()> {
        let current = self.data_length();
        if length < current {
            return Err(EtchError::Invariant(format!(
                "data length would shrink from {current} to {length}"
            )));
        }
        self.data_length.store(length, Ordering::Release);
        Ok(())
    }

    fn append_record(&self, key: &Hash, record: &Record) -> EtchResult<u64> {
        let bytes = record.encode(key)?;
        let offset = self.data_length();
        self.regions.map_at(offset, bytes.len())?.write(0, &bytes);
        self.set_data_length(offset + bytes.len() as u64)?;
        Ok(offset)
    }

    fn append_index_block(&self, level: usize) -> EtchResult<u64> {
        let len = index_block_len(level);
        let offset = self.data_length();
        // The tail may hold bytes from an unflushed session; start clean.
        self.regions.map_at(offset, len)?.fill_zero(0, len);
        self.set_data_length(offset + len as u64)?;
        debug!(level, offset, "allocated index block");
        Ok(offset)
    }

    fn update_in_place(&self, offset: u64, record: &Record) -> EtchResult<()> {
        let head = self.record_header(offset)?;
        let view = self.regions.map_at(offset, RECORD_HEADER_SIZE)?;
        let merged = head.flags.merge(record.flags);
        if merged != head.flags {
            view.write(RECORD_OFFSET_FLAGS, &[merged.bits()]);
        }
        if head.memory_size == 0 && record.memory_size != 0 {
            view.write_u64(RECORD_OFFSET_MEMORY_SIZE, record.memory_size);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Insertion
    // ---------------------------------------------------------------

    fn write_entry(
        &self,
        key: &Hash,
        source: Source<'_>,
        block: u64,
        level: usize,
    ) -> EtchResult<Placement> {
        if level >= MAX_LEVEL {
            return Err(EtchError::MaxLevelExceeded(*key));
        }
        let size = index_size(level);
        let d = digit(key, level);
        let slot = self.read_slot(block, d)?;
        if slot.is_empty() {
            return self.place(key, source, block, d, SlotKind::Plain);
        }

        match slot.kind() {
            SlotKind::Index => {
                self.check_index_block(slot.offset(), level + 1)?;
                self.write_entry(key, source, slot.offset(), level + 1)
            }
            SlotKind::Plain => {
                let existing = self.compare_key(slot.offset(), key)?;
                if existing.matched {
                    return self.merge_existing(key, slot.offset(), source);
                }
                let next = (d + 1) % size;
                if self.read_slot(block, next)?.is_empty() {
                    let placed =
                        self.place(key, source, block, next, SlotKind::ChainContinuation)?;
                    self.write_slot(block, d, slot.with_kind(SlotKind::ChainHead))?;
                    return Ok(placed);
                }
                // Neighbour taken: push the resident entry down a level.
                let child = self.append_index_block(level + 1)?;
                self.write_entry(
                    &existing.stored,
                    Source::Existing(slot.offset()),
                    child,
                    level + 1,
                )?;
                self.write_slot(block, d, Slot::new(SlotKind::Index, child))?;
                self.write_entry(key, source, child, level + 1)
            }
            SlotKind::ChainHead => {
                if self.compare_key(slot.offset(), key)?.matched {
                    return self.merge_existing(key, slot.offset(), source);
                }
                for i in 1..size {
                    let ix = (d + i) % size;
                    let s = self.read_slot(block, ix)?;
                    if s.is_empty() {
                        return self.place(key, source, block, ix, SlotKind::ChainContinuation);
                    }
                    if s.kind() != SlotKind::ChainContinuation {
                        break;
                    }
                    if self.compare_key(s.offset(), key)?.matched {
                        return self.merge_existing(key, s.offset(), source);
                    }
                }
                // The chain cannot grow: move it into a child block and
                // descend into that.
                self.collapse_chain(block, d, level)?;
                self.write_entry(key, source, block, level)
            }
            SlotKind::ChainContinuation => {
                // Our digit is occupied by someone else's chain.
                let head = self.find_chain_head(block, d, level)?;
                self.collapse_chain(block, head, level)?;
                self.write_entry(key, source, block, level)
            }
        }
    }

    /// Fill an empty slot.
    fn place(
        &self,
        key: &Hash,
        source: Source<'_>,
        block: u64,
        ix: usize,
        kind: SlotKind,
    ) -> EtchResult<Placement> {
        let (offset, created) = match source {
            Source::New(record) => (self.append_record(key, record)?, true),
            Source::Existing(offset) => (offset, false),
        };
        self.write_slot(block, ix, Slot::new(kind, offset))?;
        Ok(Placement { offset, created })
    }

    fn merge_existing(&self, key: &Hash, offset: u64, source: Source<'_>) -> EtchResult<Placement> {
        match source {
            Source::New(record) => {
                self.update_in_place(offset, record)?;
                Ok(Placement {
                    offset,
                    created: false,
                })
            }
            Source::Existing(moving) if moving == offset => Ok(Placement {
                offset,
                created: false,
            }),
            Source::Existing(moving) => Err(EtchError::corruption(
                moving,
                format!("second record for key {} (first at {offset})", key.short_hex()),
            )),
        }
    }

    fn find_chain_head(&self, block: u64, from: usize, level: usize) -> EtchResult<usize> {
        let size = index_size(level);
        for i in 1..size {
            let ix = (from + size - i) % size;
            let s = self.read_slot(block, ix)?;
            if s.is_empty() {
                break;
            }
            match s.kind() {
                SlotKind::ChainHead => return Ok(ix),
                SlotKind::ChainContinuation => continue,
                _ => break,
            }
        }
        Err(EtchError::corruption(
            block + (from * SLOT_SIZE) as u64,
            "chain continuation without a chain head",
        ))
    }

    /// Move the chain starting at `head` into a new child block at
    /// `level + 1`, then point `head` at the child and clear the vacated
    /// continuation slots.
    fn collapse_chain(&self, block: u64, head: usize, level: usize) -> EtchResult<()> {
        let size = index_size(level);
        let head_slot = self.read_slot(block, head)?;
        if head_slot.is_empty() || head_slot.kind() != SlotKind::ChainHead {
            return Err(EtchError::corruption(
                block + (head * SLOT_SIZE) as u64,
                "collapse started on a non-head slot",
            ));
        }

        let mut members = vec![head_slot.offset()];
        for i in 1..size {
            let s = self.read_slot(block, (head + i) % size)?;
            if s.is_empty() || s.kind() != SlotKind::ChainContinuation {
                break;
            }
            members.push(s.offset());
        }

        let child = self.append_index_block(level + 1)?;
        for &offset in &members {
            let key = self.record_header(offset)?.key;
            self.write_entry(&key, Source::Existing(offset), child, level + 1)?;
        }

        // Publish the child before clearing, so readers always find members.
        self.write_slot(block, head, Slot::new(SlotKind::Index, child))?;
        for i in 1..members.len() {
            self.write_slot(block, (head + i) % size, Slot::EMPTY)?;
        }
        debug!(level, head, members = members.len(), child, "collapsed chain into child index");
        Ok(())
    }
}

impl Drop for Etch {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                warn!(path = %self.path.display(), error = %e, "failed to close Etch store on drop");
            }
        }
    }
}

impl std::fmt::Debug for Etch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Etch")
            .field("path", &self.path)
            .field("data_length", &self.data_length())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read and validate the header of an existing file.
fn read_header(file: &File, file_len: u64) -> EtchResult<Header> {
    if file_len < HEADER_SIZE as u64 {
        return Err(EtchError::corruption(0, "file shorter than header"));
    }
    let mut buf = [0u8; HEADER_SIZE];
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut buf)?;
    let header = Header::decode(&buf)?;
    if header.data_length < MIN_DATA_LENGTH || header.data_length > file_len {
        return Err(EtchError::corruption(
            OFFSET_DATA_LENGTH as u64,
            format!(
                "data length {} outside [{MIN_DATA_LENGTH}, {file_len}]",
                header.data_length
            ),
        ));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etch_types::Status;
    use rand::{Rng, RngCore};

    fn record(payload: &[u8]) -> Record {
        Record::new(Flags::with_status(Status::Stored), 0, payload.to_vec())
    }

    fn key_from(prefix: &[u8], last: u8) -> Hash {
        let mut k = [0u8; 32];
        k[..prefix.len()].copy_from_slice(prefix);
        k[31] = last;
        Hash::from_bytes(k)
    }

    fn slot_at(etch: &Etch, block: u64, digit: usize) -> Slot {
        etch.read_slot(block, digit).unwrap()
    }

    /// Offset of the child block `block[digit]` points at.
    fn child_at(etch: &Etch, block: u64, digit: usize) -> u64 {
        let slot = slot_at(etch, block, digit);
        assert_eq!(slot.kind(), SlotKind::Index, "slot {digit} is not an index");
        slot.offset()
    }

    /// Write `key`, which must start `[first, 0x00, 0x40]`, with two blockers
    /// that push such keys into a level-2 block once a third one arrives.
    fn seed_level_two(etch: &Etch, first: u8, key: Hash) {
        etch.write(&key_from(&[first, 0x02], 0), &record(b"level 0 blocker"))
            .unwrap();
        etch.write(&key, &record(key.as_bytes())).unwrap();
        etch.write(&key_from(&[first, 0x00, 0x42], 0), &record(b"level 1 blocker"))
            .unwrap();
    }

    // -----------------------------------------------------------------------
    // Basic operations
    // -----------------------------------------------------------------------

    #[test]
    fn fresh_store_layout() {
        let etch = Etch::create_temp().unwrap();
        assert_eq!(etch.data_length(), MIN_DATA_LENGTH);
        assert_eq!(etch.root_hash().unwrap(), Hash::ZERO);
        assert!(etch.physical_length().unwrap() >= MIN_DATA_LENGTH);
    }

    #[test]
    fn write_then_read() {
        let etch = Etch::create_temp().unwrap();
        let key = Hash::digest(b"hello");
        let result = etch.write(&key, &record(b"world")).unwrap();
        assert!(result.created);
        assert_eq!(result.offset, MIN_DATA_LENGTH);

        let read = etch.read(&key).unwrap().unwrap();
        assert_eq!(read.payload, b"world");
        assert_eq!(read.flags.status(), Status::Stored);
        assert!(etch.contains(&key).unwrap());

        let (stored_key, at) = etch.read_at(result.offset).unwrap();
        assert_eq!(stored_key, key);
        assert_eq!(at, read);
    }

    #[test]
    fn missing_key_is_not_found() {
        let etch = Etch::create_temp().unwrap();
        etch.write(&Hash::digest(b"a"), &record(b"1")).unwrap();
        assert!(etch.read(&Hash::digest(b"b")).unwrap().is_none());
        assert!(!etch.contains(&Hash::digest(b"c")).unwrap());
    }

    #[test]
    fn rewrite_merges_flags_without_new_record() {
        let etch = Etch::create_temp().unwrap();
        let key = Hash::digest(b"idempotent");
        etch.write(&key, &record(b"payload")).unwrap();
        let length = etch.data_length();

        let upgrade = Record::new(
            Flags::with_status(Status::Persisted).insert(Flags::VERIFIED),
            512,
            b"payload".to_vec(),
        );
        let result = etch.write(&key, &upgrade).unwrap();
        assert!(!result.created);
        assert_eq!(result.flags.status(), Status::Persisted);
        assert_eq!(result.memory_size, 512);
        assert_eq!(etch.data_length(), length);

        // A lower status never downgrades, and size metadata is kept.
        let downgrade = Record::new(Flags::with_status(Status::Stored), 7, b"payload".to_vec());
        let result = etch.write(&key, &downgrade).unwrap();
        assert_eq!(result.flags.status(), Status::Persisted);
        assert!(result.flags.contains(Flags::VERIFIED));
        assert_eq!(result.memory_size, 512);
        assert_eq!(etch.data_length(), length);

        let read = etch.read(&key).unwrap().unwrap();
        assert_eq!(read.payload, b"payload");
        assert_eq!(read.memory_size, 512);
    }

    #[test]
    fn oversized_payload_is_rejected_but_recoverable() {
        let etch = Etch::create_temp().unwrap();
        let key = Hash::digest(b"limits");
        let err = etch.write(&key, &record(&vec![1; 65536])).unwrap_err();
        assert!(matches!(err, EtchError::PayloadTooLarge(65536)));
        assert!(!err.is_fatal());

        let big = vec![0xAB; 65535];
        etch.write(&key, &record(&big)).unwrap();
        assert_eq!(etch.read(&key).unwrap().unwrap().payload, big);
    }

    #[test]
    fn empty_payload_poisons_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poisoned.etch");
        let good = Hash::digest(b"good");
        let length = {
            let etch = Etch::open(&path).unwrap();
            etch.write(&good, &record(b"ok")).unwrap();
            etch.flush().unwrap();
            let length = etch.data_length();

            let err = etch.write(&Hash::digest(b"empty"), &record(&[])).unwrap_err();
            assert!(matches!(err, EtchError::EmptyPayload(_)));
            assert!(err.is_fatal());
            assert!(matches!(
                etch.write(&good, &record(b"ok")),
                Err(EtchError::Poisoned)
            ));
            assert!(matches!(etch.flush(), Err(EtchError::Poisoned)));
            // Reads keep working.
            assert!(etch.contains(&good).unwrap());
            etch.close().unwrap();
            length
        };
        let etch = Etch::open(&path).unwrap();
        assert_eq!(etch.data_length(), length);
        assert!(etch.contains(&good).unwrap());
    }

    #[test]
    fn poisoned_close_keeps_unflushed_writes_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poisoned-unflushed.etch");
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let c = Hash::digest(b"c");
        {
            let etch = Etch::open(&path).unwrap();
            etch.write(&a, &record(b"flushed")).unwrap();
            etch.flush().unwrap();
            etch.write(&b, &record(b"after flush")).unwrap();
            let length = etch.data_length();
            assert!(etch.write(&Hash::digest(b"e"), &record(&[])).is_err());
            etch.close().unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), length);
        }

        let etch = Etch::open(&path).unwrap();
        assert_eq!(etch.read(&b).unwrap().unwrap().payload, b"after flush");
        etch.write(&c, &record(b"next session")).unwrap();
        assert_eq!(etch.read(&a).unwrap().unwrap().payload, b"flushed");
        assert_eq!(etch.read(&b).unwrap().unwrap().payload, b"after flush");
        assert_eq!(etch.read(&c).unwrap().unwrap().payload, b"next session");
        let report = etch.validate().unwrap();
        assert!(report.is_clean(), "issues: {:?}", report.issues);
        assert_eq!(report.values, 3);
    }

    #[test]
    fn raw_keys_must_be_32_bytes() {
        let etch = Etch::create_temp().unwrap();
        let err = etch.write_raw(&[1u8; 20], &record(b"x")).unwrap_err();
        assert!(matches!(err, EtchError::InvalidKeyLength(20)));
        etch.write_raw(&[1u8; 32], &record(b"x")).unwrap();
        assert!(etch.contains(&Hash::from_bytes([1u8; 32])).unwrap());
    }

    #[test]
    fn read_at_rejects_offsets_outside_data() {
        let etch = Etch::create_temp().unwrap();
        assert!(matches!(
            etch.read_at(10),
            Err(EtchError::Corruption { .. })
        ));
        assert!(matches!(
            etch.read_at(etch.data_length() + 100),
            Err(EtchError::Corruption { .. })
        ));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_any_payload(
            key in proptest::prelude::any::<[u8; 32]>(),
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..=65535),
            status in 0u8..=4,
            memory_size in proptest::prelude::any::<u64>(),
        ) {
            let etch = Etch::create_temp().unwrap();
            let key = Hash::from_bytes(key);
            let flags = Flags::with_status(Status::from_u8(status).unwrap());
            let written = Record::new(flags, memory_size, payload);
            etch.write(&key, &written).unwrap();
            let read = etch.read(&key).unwrap().unwrap();
            proptest::prop_assert_eq!(read, written);
        }
    }

    // -----------------------------------------------------------------------
    // Collisions
    // -----------------------------------------------------------------------

    #[test]
    fn collision_builds_chain() {
        let etch = Etch::create_temp().unwrap();
        let a = key_from(&[0x40, 0x00], 1);
        let b = key_from(&[0x40, 0x00], 2);
        etch.write(&a, &record(b"a")).unwrap();
        etch.write(&b, &record(b"b")).unwrap();

        let d = digit(&a, 0);
        assert_eq!(slot_at(&etch, INDEX_START, d).kind(), SlotKind::ChainHead);
        assert_eq!(
            slot_at(&etch, INDEX_START, d + 1).kind(),
            SlotKind::ChainContinuation
        );
        assert_eq!(etch.read(&a).unwrap().unwrap().payload, b"a");
        assert_eq!(etch.read(&b).unwrap().unwrap().payload, b"b");
    }

    #[test]
    fn collision_with_taken_neighbour_splits_into_child() {
        let etch = Etch::create_temp().unwrap();
        let blocker = key_from(&[0x50, 0x01], 0);
        let a = key_from(&[0x50, 0x00, 0x10], 1);
        let b = key_from(&[0x50, 0x00, 0x20], 2);
        etch.write(&blocker, &record(b"blocker")).unwrap();
        etch.write(&a, &record(b"a")).unwrap();
        etch.write(&b, &record(b"b")).unwrap();

        let slot = slot_at(&etch, INDEX_START, digit(&a, 0));
        assert_eq!(slot.kind(), SlotKind::Index);
        assert_eq!(slot_at(&etch, slot.offset(), 0x10).kind(), SlotKind::Plain);
        assert_eq!(slot_at(&etch, slot.offset(), 0x20).kind(), SlotKind::Plain);
        for (k, v) in [(blocker, &b"blocker"[..]), (a, b"a"), (b, b"b")] {
            assert_eq!(etch.read(&k).unwrap().unwrap().payload, v);
        }
    }

    #[test]
    fn blocked_chain_collapses_into_child() {
        let etch = Etch::create_temp().unwrap();
        let prefix = [0xAA, 0x10];
        let d = digit(&key_from(&prefix, 0), 0);
        // Occupy d+2 so the chain at d can only reach d+1.
        let blocker = key_from(&[0xAA, 0x12, 0xFF], 0);
        etch.write(&blocker, &record(b"blocker")).unwrap();

        let keys: Vec<Hash> = (0..21).map(|i| key_from(&prefix, i)).collect();
        for (i, k) in keys.iter().enumerate() {
            etch.write(k, &record(&[i as u8 + 1])).unwrap();
        }

        let top = slot_at(&etch, INDEX_START, d);
        assert_eq!(top.kind(), SlotKind::Index);
        assert!(slot_at(&etch, INDEX_START, d + 1).is_empty());
        assert_eq!(slot_at(&etch, INDEX_START, d + 2).kind(), SlotKind::Plain);

        // All keys share byte 2, so they chain inside the level-1 block.
        assert_eq!(slot_at(&etch, top.offset(), 0).kind(), SlotKind::ChainHead);
        for ix in 1..21 {
            assert_eq!(
                slot_at(&etch, top.offset(), ix).kind(),
                SlotKind::ChainContinuation
            );
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(etch.read(k).unwrap().unwrap().payload, vec![i as u8 + 1]);
        }
        assert_eq!(etch.read(&blocker).unwrap().unwrap().payload, b"blocker");
    }

    #[test]
    fn continuation_hit_directly_collapses_its_chain() {
        let etch = Etch::create_temp().unwrap();
        let blocker = key_from(&[0xAA, 0x12, 0xFF], 0);
        etch.write(&blocker, &record(b"blocker")).unwrap();
        let keys: Vec<Hash> = (0..21).map(|i| key_from(&[0xAA, 0x10], i)).collect();
        for k in &keys {
            etch.write(k, &record(k.as_bytes())).unwrap();
        }

        // Lands on level-1 slot 5, a continuation of the chain at slot 0.
        let intruder = key_from(&[0xAA, 0x10, 0x05], 0xEE);
        etch.write(&intruder, &record(b"intruder")).unwrap();

        let top = slot_at(&etch, INDEX_START, digit(&intruder, 0));
        assert_eq!(slot_at(&etch, top.offset(), 0).kind(), SlotKind::Index);
        assert_eq!(slot_at(&etch, top.offset(), 5).kind(), SlotKind::Plain);
        assert!(slot_at(&etch, top.offset(), 6).is_empty());

        assert_eq!(etch.read(&intruder).unwrap().unwrap().payload, b"intruder");
        for k in &keys {
            assert_eq!(etch.read(k).unwrap().unwrap().payload, k.as_bytes());
        }
    }

    #[test]
    fn keys_differing_only_in_last_byte_descend_deep() {
        let etch = Etch::create_temp().unwrap();
        let blocker = key_from(&[0x33, 0x02], 0);
        etch.write(&blocker, &record(b"b")).unwrap();
        // 17 keys: more than one 16-slot block can chain.
        let keys: Vec<Hash> = (0..17).map(|i| key_from(&[0x33, 0x00], i)).collect();
        for k in &keys {
            etch.write(k, &record(k.as_bytes())).unwrap();
        }
        let intruder = key_from(&[0x33, 0x00, 0x03], 0);
        etch.write(&intruder, &record(b"i")).unwrap();

        for k in &keys {
            assert_eq!(etch.read(k).unwrap().unwrap().payload, k.as_bytes());
        }
        assert_eq!(etch.read(&intruder).unwrap().unwrap().payload, b"i");
        assert!(etch.read(&key_from(&[0x33, 0x00], 200)).unwrap().is_none());
    }

    #[test]
    fn chain_fills_whole_block_then_collapses() {
        let etch = Etch::create_temp().unwrap();
        // Sixteen keys sharing digits down to level 3, split at level 4.
        let keys: Vec<Hash> = (0..16u8)
            .map(|i| key_from(&[0x61, 0x00, 0x40, 0x00, i << 4], 0))
            .collect();
        seed_level_two(&etch, 0x61, keys[0]);
        for k in &keys[1..] {
            etch.write(k, &record(k.as_bytes())).unwrap();
        }

        let level1 = child_at(&etch, INDEX_START, 0x6100);
        let level2 = child_at(&etch, level1, 0x40);
        assert_eq!(slot_at(&etch, level2, 0).kind(), SlotKind::ChainHead);
        for ix in 1..index_size(2) {
            assert_eq!(
                slot_at(&etch, level2, ix).kind(),
                SlotKind::ChainContinuation
            );
        }
        assert!(etch.validate().unwrap().is_clean());

        // Level-2 digit 0, level-3 digit 1: the full chain has nowhere to go.
        let extra = key_from(&[0x61, 0x00, 0x40, 0x01], 0);
        etch.write(&extra, &record(b"extra")).unwrap();

        let level3 = child_at(&etch, level2, 0);
        for ix in 1..index_size(2) {
            assert!(slot_at(&etch, level2, ix).is_empty());
        }
        let level4 = child_at(&etch, level3, 0);
        assert_eq!(slot_at(&etch, level3, 1).kind(), SlotKind::Plain);
        for ix in 2..index_size(3) {
            assert!(slot_at(&etch, level3, ix).is_empty());
        }
        for ix in 0..index_size(4) {
            assert_eq!(slot_at(&etch, level4, ix).kind(), SlotKind::Plain);
        }

        for k in &keys {
            assert_eq!(etch.read(k).unwrap().unwrap().payload, k.as_bytes());
        }
        assert_eq!(etch.read(&extra).unwrap().unwrap().payload, b"extra");
        let report = etch.validate().unwrap();
        assert!(report.is_clean(), "issues: {:?}", report.issues);
        assert_eq!(report.values, 19);
        assert_eq!(report.max_depth, 4);
    }

    #[test]
    fn chain_wraps_past_end_of_block() {
        let etch = Etch::create_temp().unwrap();
        // Level-2 digit 15: the chain starts in the last slot.
        let keys: Vec<Hash> = (0..5u8)
            .map(|i| key_from(&[0x62, 0x00, 0x40, 0xF0, i << 4], 0))
            .collect();
        seed_level_two(&etch, 0x62, keys[0]);
        for k in &keys[1..] {
            etch.write(k, &record(k.as_bytes())).unwrap();
        }

        let level1 = child_at(&etch, INDEX_START, 0x6200);
        let level2 = child_at(&etch, level1, 0x40);
        assert_eq!(slot_at(&etch, level2, 15).kind(), SlotKind::ChainHead);
        for ix in 0..4 {
            assert_eq!(
                slot_at(&etch, level2, ix).kind(),
                SlotKind::ChainContinuation
            );
        }
        assert!(slot_at(&etch, level2, 4).is_empty());
        for k in &keys {
            assert_eq!(etch.read(k).unwrap().unwrap().payload, k.as_bytes());
        }
        assert!(etch.validate().unwrap().is_clean());

        // Home digit 1 is a wrapped continuation: its chain moves down.
        let intruder = key_from(&[0x62, 0x00, 0x40, 0x10], 0);
        etch.write(&intruder, &record(b"intruder")).unwrap();

        let level3 = child_at(&etch, level2, 15);
        assert!(slot_at(&etch, level2, 0).is_empty());
        assert_eq!(slot_at(&etch, level2, 1).kind(), SlotKind::Plain);
        for ix in 2..4 {
            assert!(slot_at(&etch, level2, ix).is_empty());
        }
        assert_eq!(slot_at(&etch, level3, 0).kind(), SlotKind::ChainHead);
        for k in &keys {
            assert_eq!(etch.read(k).unwrap().unwrap().payload, k.as_bytes());
        }
        assert_eq!(etch.read(&intruder).unwrap().unwrap().payload, b"intruder");
        let report = etch.validate().unwrap();
        assert!(report.is_clean(), "issues: {:?}", report.issues);
        assert_eq!(report.values, 8);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    #[test]
    fn root_hash_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.etch");
        let root = Hash::digest(b"state");
        {
            let etch = Etch::open(&path).unwrap();
            etch.set_root_hash(&root).unwrap();
            assert_eq!(etch.root_hash().unwrap(), root);
            etch.close().unwrap();
        }
        let etch = Etch::open(&path).unwrap();
        assert_eq!(etch.root_hash().unwrap(), root);
    }

    #[test]
    fn write_close_reopen_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.etch");
        let first = Hash::digest(b"first");
        let second = Hash::digest(b"second");
        {
            let etch = Etch::open(&path).unwrap();
            etch.write(&first, &record(b"one")).unwrap();
            etch.close().unwrap();
            assert_eq!(
                std::fs::metadata(&path).unwrap().len(),
                etch.data_length()
            );
        }
        let etch = Etch::open(&path).unwrap();
        etch.write(&second, &record(b"two")).unwrap();
        assert_eq!(etch.read(&first).unwrap().unwrap().payload, b"one");
        assert_eq!(etch.read(&second).unwrap().unwrap().payload, b"two");
        let length = etch.data_length();
        etch.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), length);

        let mut header = [0u8; HEADER_SIZE];
        let mut f = File::open(&path).unwrap();
        f.read_exact(&mut header).unwrap();
        assert_eq!(Header::decode(&header).unwrap().data_length, length);
    }

    #[test]
    fn drop_closes_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.etch");
        let key = Hash::digest(b"dropped");
        {
            let etch = Etch::open(&path).unwrap();
            etch.write(&key, &record(b"still here")).unwrap();
        }
        let etch = Etch::open(&path).unwrap();
        assert_eq!(etch.read(&key).unwrap().unwrap().payload, b"still here");
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.etch");
        let etch = Etch::open(&path).unwrap();
        let err = Etch::open(&path).unwrap_err();
        assert!(matches!(err, EtchError::Locked(_)));
        assert!(err.is_fatal());
        etch.close().unwrap();
        Etch::open(&path).unwrap();
    }

    #[test]
    fn bad_magic_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.etch");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        let err = Etch::open(&path).unwrap_err();
        assert!(matches!(err, EtchError::InvalidHeader { .. }));
        // Opening must not have grown the file.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn truncated_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.etch");
        std::fs::write(&path, Header::new(MIN_DATA_LENGTH).encode()).unwrap();
        assert!(matches!(
            Etch::open(&path),
            Err(EtchError::Corruption { .. })
        ));
    }

    #[test]
    fn closed_store_rejects_operations() {
        let etch = Etch::create_temp().unwrap();
        let key = Hash::digest(b"k");
        etch.write(&key, &record(b"v")).unwrap();
        etch.close().unwrap();
        etch.close().unwrap();
        assert!(etch.is_closed());
        assert!(matches!(etch.read(&key), Err(EtchError::Closed)));
        assert!(matches!(
            etch.write(&key, &record(b"v")),
            Err(EtchError::Closed)
        ));
        assert!(matches!(etch.flush(), Err(EtchError::Closed)));
    }

    // -----------------------------------------------------------------------
    // Scale and concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn many_random_keys_roundtrip() {
        let etch = Etch::create_temp().unwrap();
        let mut rng = rand::thread_rng();
        let mut entries = Vec::new();
        let mut last_length = etch.data_length();
        for _ in 0..2000 {
            let key = Hash::random();
            let mut payload = vec![0u8; rng.gen_range(1..=300)];
            rng.fill_bytes(&mut payload);
            etch.write(&key, &record(&payload)).unwrap();
            assert!(etch.data_length() > last_length);
            last_length = etch.data_length();
            entries.push((key, payload));
        }
        assert!(etch.data_length() <= etch.physical_length().unwrap());
        for (key, payload) in &entries {
            assert_eq!(&etch.read(key).unwrap().unwrap().payload, payload);
        }
        for _ in 0..500 {
            assert!(etch.read(&Hash::random()).unwrap().is_none());
        }
    }

    #[test]
    fn concurrent_readers_and_writer() {
        use std::sync::Arc;

        let etch = Arc::new(Etch::create_temp().unwrap());
        let seeded: Vec<Hash> = (0..200u32)
            .map(|i| Hash::digest(&i.to_be_bytes()))
            .collect();
        for k in &seeded {
            etch.write(k, &record(k.as_bytes())).unwrap();
        }

        let writer = {
            let etch = Arc::clone(&etch);
            std::thread::spawn(move || {
                for i in 1000..3000u32 {
                    let k = Hash::digest(&i.to_be_bytes());
                    etch.write(&k, &record(&i.to_be_bytes())).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let etch = Arc::clone(&etch);
                let seeded = seeded.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        for k in &seeded {
                            let rec = etch.read(k).unwrap().unwrap();
                            assert_eq!(rec.payload, k.as_bytes());
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        for i in 1000..3000u32 {
            let k = Hash::digest(&i.to_be_bytes());
            assert_eq!(etch.read(&k).unwrap().unwrap().payload, i.to_be_bytes());
        }
    }
}
