//! Memory-mapped regions over the backing file.
//!
//! The file is split into consecutive 1 GiB windows. Window `i` is backed by
//! one mapping that starts at `i * MAX_REGION_SIZE` and is grown lazily by
//! doubling, up to the window size plus [`REGION_MARGIN`]. Because every
//! mapping extends past its window by the margin, any access of at most
//! `REGION_MARGIN` bytes that starts inside a window lies entirely inside
//! that window's mapping.
//!
//! Growth replaces the region's mapping with a larger one. Views handed out
//! earlier keep the old mapping alive through their `Arc`, and both
//! mappings share the same file pages, so no caller ever sees a dangling
//! pointer or stale bytes.

use std::fs::File;
use std::sync::{Arc, RwLock};

use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

use crate::error::{EtchError, EtchResult};
use crate::format::{MAX_REGION_SIZE, REGION_MARGIN};

/// Upper bound on a single mapping.
const MAX_MAPPING_SIZE: usize = MAX_REGION_SIZE + REGION_MARGIN;

struct MappedRegion {
    map: MmapRaw,
    start: u64,
}

impl MappedRegion {
    fn capacity(&self) -> usize {
        self.map.len()
    }
}

/// A bounded window into one mapped region, positioned at a file offset.
///
/// Each call to [`RegionManager::map_at`] returns a fresh view, so concurrent
/// readers never share a cursor. All offsets taken by the accessors are
/// relative to the view's position.
pub struct RegionView {
    region: Arc<MappedRegion>,
    base: usize,
    len: usize,
}

impl std::fmt::Debug for RegionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionView")
            .field("position", &self.position())
            .field("len", &self.len)
            .finish()
    }
}

impl RegionView {
    /// File position the view starts at.
    pub fn position(&self) -> u64 {
        self.region.start + self.base as u64
    }

    /// Number of addressable bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, at: usize, n: usize) {
        assert!(
            at.checked_add(n).is_some_and(|end| end <= self.len),
            "region view access out of bounds: {at}+{n} > {}",
            self.len
        );
    }

    pub fn read(&self, at: usize, buf: &mut [u8]) {
        self.check(at, buf.len());
        // SAFETY: `check` keeps the range inside `len`, and `map_at` only
        // builds views with `base + len <= capacity`. The mapping is alive
        // while `self.region` is held.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.map.as_ptr().add(self.base + at),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    pub fn read_u64(&self, at: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.read(at, &mut buf);
        u64::from_be_bytes(buf)
    }

    /// Write bytes through the mapping.
    ///
    /// Callers must hold the engine's write lock; readers may observe the
    /// bytes as soon as they land.
    pub(crate) fn write(&self, at: usize, data: &[u8]) {
        self.check(at, data.len());
        // SAFETY: bounds as in `read`. The mapping is read-write and shared
        // with the file, and the single-writer lock serializes mutation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.region.map.as_mut_ptr().add(self.base + at),
                data.len(),
            );
        }
    }

    pub(crate) fn write_u64(&self, at: usize, value: u64) {
        self.write(at, &value.to_be_bytes());
    }

    pub(crate) fn fill_zero(&self, at: usize, n: usize) {
        self.check(at, n);
        // SAFETY: as in `write`.
        unsafe {
            std::ptr::write_bytes(self.region.map.as_mut_ptr().add(self.base + at), 0, n);
        }
    }
}

/// Owns the backing file and its growable set of mapped regions.
pub struct RegionManager {
    file: File,
    initial_size: usize,
    /// Serializes region creation and growth. Distinct from the engine's
    /// write lock because reads can grow a region too.
    regions: RwLock<RegionTable>,
}

#[derive(Default)]
struct RegionTable {
    maps: Vec<Option<Arc<MappedRegion>>>,
    closed: bool,
}

impl RegionManager {
    pub fn new(file: File, initial_size: usize) -> Self {
        Self {
            file,
            initial_size,
            regions: RwLock::new(RegionTable::default()),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Physical length of the backing file, including over-allocation.
    pub fn physical_length(&self) -> EtchResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Number of regions currently mapped.
    pub fn mapped_regions(&self) -> usize {
        let regions = self.regions.read().expect("region lock poisoned");
        regions.maps.iter().filter(|r| r.is_some()).count()
    }

    /// A view of `len` bytes at `position`, growing or creating the region as
    /// needed.
    pub fn map_at(&self, position: u64, len: usize) -> EtchResult<RegionView> {
        if len > REGION_MARGIN {
            return Err(EtchError::Invariant(format!(
                "access of {len} bytes exceeds region margin"
            )));
        }
        let index = (position / MAX_REGION_SIZE as u64) as usize;
        let base = (position % MAX_REGION_SIZE as u64) as usize;
        let needed = base + len;

        {
            let regions = self.regions.read().expect("region lock poisoned");
            if regions.closed {
                return Err(EtchError::Closed);
            }
            if let Some(Some(region)) = regions.maps.get(index) {
                if region.capacity() >= needed {
                    return Ok(RegionView {
                        region: Arc::clone(region),
                        base,
                        len,
                    });
                }
            }
        }

        let mut regions = self.regions.write().expect("region lock poisoned");
        if regions.closed {
            return Err(EtchError::Closed);
        }
        // Another caller may have grown it while we waited.
        let current = match regions.maps.get(index) {
            Some(Some(region)) if region.capacity() >= needed => {
                return Ok(RegionView {
                    region: Arc::clone(region),
                    base,
                    len,
                });
            }
            Some(Some(region)) => region.capacity(),
            _ => 0,
        };

        let mut capacity = if current == 0 { self.initial_size } else { current };
        while capacity < needed {
            capacity *= 2;
        }
        let capacity = capacity.min(MAX_MAPPING_SIZE);
        let region = Arc::new(self.map_region(index, capacity)?);

        if regions.maps.len() <= index {
            regions.maps.resize_with(index + 1, || None);
        }
        regions.maps[index] = Some(Arc::clone(&region));
        Ok(RegionView { region, base, len })
    }

    fn map_region(&self, index: usize, capacity: usize) -> EtchResult<MappedRegion> {
        let start = index as u64 * MAX_REGION_SIZE as u64;
        let end = start + capacity as u64;
        if self.file.metadata()?.len() < end {
            self.file.set_len(end)?;
        }
        let map = MmapOptions::new()
            .offset(start)
            .len(capacity)
            .map_raw(&self.file)?;
        debug!(region = index, capacity, "mapped region");
        Ok(MappedRegion { map, start })
    }

    /// Flush every mapped region to disk.
    pub fn flush_all(&self) -> EtchResult<()> {
        let regions = self.regions.read().expect("region lock poisoned");
        for region in regions.maps.iter().flatten() {
            region.map.flush()?;
        }
        Ok(())
    }

    /// Flush a byte range that lies within one region.
    pub fn flush_range(&self, position: u64, len: usize) -> EtchResult<()> {
        let index = (position / MAX_REGION_SIZE as u64) as usize;
        let base = (position % MAX_REGION_SIZE as u64) as usize;
        let regions = self.regions.read().expect("region lock poisoned");
        if let Some(Some(region)) = regions.maps.get(index) {
            if base + len <= region.capacity() {
                region.map.flush_range(base, len)?;
            }
        }
        Ok(())
    }

    /// Drop the manager's handles on every mapping and refuse new views.
    /// Views still held by readers stay valid until they are dropped.
    pub fn unmap_all(&self) {
        let mut regions = self.regions.write().expect("region lock poisoned");
        regions.maps.clear();
        regions.closed = true;
    }
}
