//! [`CellStore`] backed by an Etch file.
//!
//! Besides the engine, the store keeps an LRU cache of resolved references
//! and runs copy-forward garbage collection:
//!
//! 1. [`EtchStore::start_gc`] opens a fresh file. From then on every write
//!    and every existence or status check goes to the new file only, while
//!    reads fall back to the old one. Persisting a value therefore copies its
//!    whole reachable graph forward.
//! 2. The caller re-persists whatever must survive, normally by handing the
//!    current root back to [`set_root_data`](CellStore::set_root_data).
//! 3. [`EtchStore::finish_gc`] checks the new file holds a persisted root,
//!    swaps it in, and closes the old file. Deleting the old file is left to
//!    the caller.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use etch_core::{Etch, Record};
use etch_types::{Flags, Hash, Status};
use lru::LruCache;
use tracing::{debug, info};

use crate::cell::Cell;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::persist::{self, Backend, Novelty, Written};
use crate::reference::Ref;
use crate::traits::CellStore;

enum Target {
    Single(Arc<Etch>),
    Migrating { from: Arc<Etch>, to: Arc<Etch> },
}

impl Target {
    /// The file that receives writes.
    fn writer(&self) -> &Arc<Etch> {
        match self {
            Self::Single(etch) => etch,
            Self::Migrating { to, .. } => to,
        }
    }

    /// The file reads fall back to, while migrating.
    fn fallback(&self) -> Option<&Arc<Etch>> {
        match self {
            Self::Single(_) => None,
            Self::Migrating { from, .. } => Some(from),
        }
    }
}

/// A [`CellStore`] over one Etch file.
pub struct EtchStore<C: Cell> {
    config: StoreConfig,
    target: RwLock<Target>,
    /// `None` when the configured capacity is zero.
    cache: Option<Mutex<LruCache<Hash, Ref<C>>>>,
}

/// The record-level view of a store for one operation.
struct View<'a, C: Cell> {
    writer: &'a Etch,
    fallback: Option<&'a Etch>,
    /// Not consulted while migrating.
    cache: Option<&'a Mutex<LruCache<Hash, Ref<C>>>>,
}

impl<C: Cell> Backend<C> for View<'_, C> {
    fn lookup(&self, hash: &Hash) -> StoreResult<Option<Flags>> {
        if let Some(cache) = self.cache {
            if let Some(r) = cache.lock().expect("lock poisoned").get(hash) {
                return Ok(Some(r.flags()));
            }
        }
        Ok(self.writer.read(hash)?.map(|record| record.flags))
    }

    fn load(&self, hash: &Hash) -> StoreResult<Option<Record>> {
        if let Some(record) = self.writer.read(hash)? {
            return Ok(Some(record));
        }
        match self.fallback {
            Some(old) => Ok(old.read(hash)?),
            None => Ok(None),
        }
    }

    fn put(&self, hash: &Hash, record: &Record) -> StoreResult<Written> {
        let result = self.writer.write(hash, record)?;
        Ok(Written {
            flags: result.flags,
            created: result.created,
        })
    }

    fn trusts_ref_flags(&self) -> bool {
        self.fallback.is_none()
    }

    fn remember(&self, r: &Ref<C>) {
        if let Some(cache) = self.cache {
            cache.lock().expect("lock poisoned").put(r.hash(), r.clone());
        }
    }
}

impl<C: Cell> EtchStore<C> {
    /// Open or create a store at `path` with default configuration.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(path, StoreConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let etch = Etch::open_with(path, config.etch.clone())?;
        Ok(Self::from_etch(etch, config))
    }

    /// A store on a temporary file, deleted when the store is dropped.
    pub fn create_temp() -> StoreResult<Self> {
        let config = StoreConfig::default();
        let etch = Etch::create_temp_with(config.etch.clone())?;
        Ok(Self::from_etch(etch, config))
    }

    fn from_etch(etch: Etch, config: StoreConfig) -> Self {
        let cache = NonZeroUsize::new(config.cache_capacity)
            .map(|cap| Mutex::new(LruCache::new(cap)));
        let etch = Arc::new(etch);
        if config.close_on_shutdown {
            etch.close_on_shutdown();
        }
        Self {
            config,
            target: RwLock::new(Target::Single(etch)),
            cache,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The engine currently receiving writes.
    pub fn engine(&self) -> Arc<Etch> {
        Arc::clone(self.read_target().writer())
    }

    /// Path of the file currently receiving writes.
    pub fn path(&self) -> PathBuf {
        self.read_target().writer().path().to_path_buf()
    }

    pub fn is_collecting(&self) -> bool {
        matches!(*self.read_target(), Target::Migrating { .. })
    }

    /// Number of cached references.
    pub fn cached(&self) -> usize {
        self.cache
            .as_ref()
            .map_or(0, |c| c.lock().expect("lock poisoned").len())
    }

    fn read_target(&self) -> RwLockReadGuard<'_, Target> {
        self.target.read().expect("lock poisoned")
    }

    fn view<'a>(&'a self, target: &'a Target) -> View<'a, C> {
        let fallback = target.fallback().map(|e| e.as_ref());
        View {
            writer: target.writer(),
            fallback,
            cache: if fallback.is_none() {
                self.cache.as_ref()
            } else {
                None
            },
        }
    }

    fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().expect("lock poisoned").clear();
        }
    }

    /// Begin copy-forward collection into a new file at `path`.
    pub fn start_gc(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let mut target = self.target.write().expect("lock poisoned");
        let current = match &*target {
            Target::Single(etch) => Arc::clone(etch),
            Target::Migrating { .. } => return Err(StoreError::GcInProgress),
        };
        let fresh = Arc::new(Etch::open_with(path.as_ref(), self.config.etch.clone())?);
        if self.config.close_on_shutdown {
            fresh.close_on_shutdown();
        }
        info!(
            from = %current.path().display(),
            to = %fresh.path().display(),
            "started garbage collection"
        );
        *target = Target::Migrating {
            from: current,
            to: fresh,
        };
        self.clear_cache();
        Ok(())
    }

    /// Complete collection: switch to the new file and close the old one.
    ///
    /// Returns the old file's path. Fails with `GcIncomplete`, leaving the
    /// collection running, unless the new file has a root that is persisted
    /// there, or both files have no root.
    pub fn finish_gc(&self) -> StoreResult<PathBuf> {
        let mut target = self.target.write().expect("lock poisoned");
        let (from, to) = match &*target {
            Target::Single(_) => return Err(StoreError::GcNotStarted),
            Target::Migrating { from, to } => (Arc::clone(from), Arc::clone(to)),
        };

        let root = to.root_hash()?;
        if root.is_zero() {
            if !from.root_hash()?.is_zero() {
                return Err(StoreError::GcIncomplete("root not set in new file".into()));
            }
        } else {
            let status = to.read(&root)?.map(|r| r.flags.status());
            if status.map_or(true, |s| s < Status::Persisted) {
                return Err(StoreError::GcIncomplete(format!(
                    "root {} not persisted in new file",
                    root.short_hex()
                )));
            }
        }

        to.flush()?;
        *target = Target::Single(Arc::clone(&to));
        self.clear_cache();
        drop(target);

        let old_path = from.path().to_path_buf();
        from.close()?;
        info!(
            old = %old_path.display(),
            new = %to.path().display(),
            data_length = to.data_length(),
            "finished garbage collection"
        );
        Ok(old_path)
    }
}

impl<C: Cell> CellStore<C> for EtchStore<C> {
    fn ref_for_hash(&self, hash: &Hash) -> StoreResult<Option<Ref<C>>> {
        let target = self.read_target();
        let view = self.view(&target);
        if let Some(cache) = view.cache {
            if let Some(r) = cache.lock().expect("lock poisoned").get(hash) {
                return Ok(Some(r.clone()));
            }
        }
        let resolved = persist::resolve(&view, hash)?;
        if let Some(r) = &resolved {
            view.remember(r);
        }
        Ok(resolved)
    }

    fn store_ref(
        &self,
        r: &Ref<C>,
        status: Status,
        novelty: Option<Novelty<'_, C>>,
        top_level: bool,
    ) -> StoreResult<Ref<C>> {
        let target = self.read_target();
        persist::store_ref(&self.view(&target), r, status, novelty, top_level)
    }

    /// While collecting, the old file's root until a new one is set.
    fn root_hash(&self) -> StoreResult<Hash> {
        let target = self.read_target();
        let root = target.writer().root_hash()?;
        match target.fallback() {
            Some(old) if root.is_zero() => Ok(old.root_hash()?),
            _ => Ok(root),
        }
    }

    fn set_root_data(&self, r: &Ref<C>) -> StoreResult<Ref<C>> {
        let target = self.read_target();
        let view = self.view(&target);
        let persisted = persist::store_ref(&view, r, Status::Persisted, None, true)?;
        let writer = target.writer();
        writer.flush()?;
        writer.set_root_hash(&persisted.hash())?;
        writer.flush()?;
        debug!(root = %persisted.hash().short_hex(), "set root data");
        Ok(persisted)
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(self.read_target().writer().flush()?)
    }

    fn close(&self) -> StoreResult<()> {
        let target = self.read_target();
        if let Some(old) = target.fallback() {
            old.close()?;
        }
        Ok(target.writer().close()?)
    }
}

impl<C: Cell> std::fmt::Debug for EtchStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtchStore")
            .field("path", &self.path())
            .field("collecting", &self.is_collecting())
            .field("cached", &self.cached())
            .finish()
    }
}
