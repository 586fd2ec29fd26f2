use etch_types::{Hash, Status};

use crate::cell::Cell;
use crate::error::StoreResult;
use crate::persist::Novelty;
use crate::reference::Ref;

/// Content-addressed store of cell graphs with a single root pointer.
///
/// All implementations must satisfy these invariants:
/// - A cell is stored under the BLAKE3 hash of its encoding and never
///   rewritten; only its status and markers move upward.
/// - A cell at `Persisted` or above has every reachable non-embedded child
///   stored at that status or above.
/// - Embedded cells live inside their parents and are stored on their own
///   only when handed to the store as a top-level value.
pub trait CellStore<C: Cell>: Send + Sync {
    /// Resolve a hash to a reference holding the decoded cell.
    ///
    /// Returns `Ok(None)` if the hash is not stored.
    fn ref_for_hash(&self, hash: &Hash) -> StoreResult<Option<Ref<C>>>;

    /// Bring `r` up to `status`, storing children first when the status
    /// requires them.
    ///
    /// `novelty` is called once for each cell written for the first time.
    /// Returns the reference with updated flags.
    fn store_ref(
        &self,
        r: &Ref<C>,
        status: Status,
        novelty: Option<Novelty<'_, C>>,
        top_level: bool,
    ) -> StoreResult<Ref<C>>;

    /// Store a top-level value and its whole reachable graph.
    fn persist(&self, r: &Ref<C>) -> StoreResult<Ref<C>> {
        self.store_ref(r, Status::Persisted, None, true)
    }

    /// Store a top-level value without its children.
    fn store(&self, r: &Ref<C>) -> StoreResult<Ref<C>> {
        self.store_ref(r, Status::Stored, None, true)
    }

    /// Hash of the current root value, [`Hash::ZERO`] if none was set.
    fn root_hash(&self) -> StoreResult<Hash>;

    /// Persist `r` and make it the root.
    fn set_root_data(&self, r: &Ref<C>) -> StoreResult<Ref<C>>;

    /// The current root value, if one was set.
    fn root_data(&self) -> StoreResult<Option<Ref<C>>> {
        let root = self.root_hash()?;
        if root.is_zero() {
            return Ok(None);
        }
        self.ref_for_hash(&root)
    }

    fn flush(&self) -> StoreResult<()>;

    fn close(&self) -> StoreResult<()>;
}
