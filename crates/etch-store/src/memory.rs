use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::RwLock;

use etch_core::Record;
use etch_types::{Flags, Hash, Status};

use crate::cell::Cell;
use crate::error::StoreResult;
use crate::persist::{self, Backend, Novelty, Written};
use crate::reference::Ref;
use crate::traits::CellStore;

/// In-memory, HashMap-based cell store.
///
/// Intended for tests and embedding. Records follow the same merge rules as
/// an Etch file: rewriting a hash only upgrades its flags and fills in
/// missing size metadata.
pub struct InMemoryCellStore<C> {
    records: RwLock<HashMap<Hash, Record>>,
    root: RwLock<Hash>,
    _cell: PhantomData<fn() -> C>,
}

impl<C> InMemoryCellStore<C> {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            root: RwLock::new(Hash::ZERO),
            _cell: PhantomData,
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().expect("lock poisoned").is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.records
            .read()
            .expect("lock poisoned")
            .contains_key(hash)
    }

    /// Stored flags for `hash`.
    pub fn flags(&self, hash: &Hash) -> Option<Flags> {
        self.records
            .read()
            .expect("lock poisoned")
            .get(hash)
            .map(|r| r.flags)
    }

    /// Remove all records and the root.
    pub fn clear(&self) {
        self.records.write().expect("lock poisoned").clear();
        *self.root.write().expect("lock poisoned") = Hash::ZERO;
    }
}

impl<C> Default for InMemoryCellStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Cell> Backend<C> for InMemoryCellStore<C> {
    fn lookup(&self, hash: &Hash) -> StoreResult<Option<Flags>> {
        Ok(self.flags(hash))
    }

    fn load(&self, hash: &Hash) -> StoreResult<Option<Record>> {
        let map = self.records.read().expect("lock poisoned");
        Ok(map.get(hash).cloned())
    }

    fn put(&self, hash: &Hash, record: &Record) -> StoreResult<Written> {
        let mut map = self.records.write().expect("lock poisoned");
        match map.get_mut(hash) {
            Some(existing) => {
                existing.flags = existing.flags.merge(record.flags);
                if existing.memory_size == 0 {
                    existing.memory_size = record.memory_size;
                }
                Ok(Written {
                    flags: existing.flags,
                    created: false,
                })
            }
            None => {
                map.insert(*hash, record.clone());
                Ok(Written {
                    flags: record.flags,
                    created: true,
                })
            }
        }
    }
}

impl<C: Cell> CellStore<C> for InMemoryCellStore<C> {
    fn ref_for_hash(&self, hash: &Hash) -> StoreResult<Option<Ref<C>>> {
        persist::resolve(self, hash)
    }

    fn store_ref(
        &self,
        r: &Ref<C>,
        status: Status,
        novelty: Option<Novelty<'_, C>>,
        top_level: bool,
    ) -> StoreResult<Ref<C>> {
        persist::store_ref(self, r, status, novelty, top_level)
    }

    fn root_hash(&self) -> StoreResult<Hash> {
        Ok(*self.root.read().expect("lock poisoned"))
    }

    fn set_root_data(&self, r: &Ref<C>) -> StoreResult<Ref<C>> {
        let persisted = self.persist(r)?;
        *self.root.write().expect("lock poisoned") = persisted.hash();
        Ok(persisted)
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl<C> std::fmt::Debug for InMemoryCellStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCellStore")
            .field("record_count", &self.len())
            .finish()
    }
}
