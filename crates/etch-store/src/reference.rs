use std::fmt;
use std::sync::Arc;

use etch_types::{Flags, Hash, Status};

use crate::cell::Cell;
use crate::error::StoreResult;

/// A reference to a cell: absent, held in memory, or known only by hash.
///
/// A reference carries the flags last observed for its cell. The status in
/// those flags is what the holder knows, which may lag what a store knows.
pub enum Ref<C> {
    /// The canonical null value. Never stored.
    Null,
    /// A cell held in memory along with its content hash.
    Direct {
        cell: Arc<C>,
        hash: Hash,
        flags: Flags,
    },
    /// A cell known only by hash; its bytes live in a store.
    Stub { hash: Hash, flags: Flags },
}

impl<C: Cell> Ref<C> {
    /// Reference a cell, computing its content hash.
    pub fn new(cell: C) -> StoreResult<Self> {
        Self::from_arc(Arc::new(cell))
    }

    pub fn from_arc(cell: Arc<C>) -> StoreResult<Self> {
        let hash = Hash::digest(&cell.encode()?);
        let marker = if cell.is_embedded() {
            Flags::EMBEDDED
        } else {
            Flags::NON_EMBEDDED
        };
        Ok(Self::Direct {
            cell,
            hash,
            flags: Flags::default().insert(marker),
        })
    }

    /// Whether the referenced cell is small enough to live inside its
    /// parents. Null counts as embedded.
    pub fn is_embedded(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Direct { cell, .. } => cell.is_embedded(),
            Self::Stub { flags, .. } => flags.contains(Flags::EMBEDDED),
        }
    }
}

impl<C> Ref<C> {
    /// Reference a cell by hash alone.
    pub fn stub(hash: Hash) -> Self {
        Self::Stub {
            hash,
            flags: Flags::default(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct { .. })
    }

    /// Content hash of the cell. The null reference hashes to [`Hash::ZERO`].
    pub fn hash(&self) -> Hash {
        match self {
            Self::Null => Hash::ZERO,
            Self::Direct { hash, .. } | Self::Stub { hash, .. } => *hash,
        }
    }

    pub fn flags(&self) -> Flags {
        match self {
            Self::Null => Flags::default(),
            Self::Direct { flags, .. } | Self::Stub { flags, .. } => *flags,
        }
    }

    pub fn status(&self) -> Status {
        self.flags().status()
    }

    /// The in-memory cell, if this reference holds one.
    pub fn cell(&self) -> Option<&Arc<C>> {
        match self {
            Self::Direct { cell, .. } => Some(cell),
            _ => None,
        }
    }

    /// Same reference with replaced flags. Null stays null.
    pub fn with_flags(self, flags: Flags) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Direct { cell, hash, .. } => Self::Direct { cell, hash, flags },
            Self::Stub { hash, .. } => Self::Stub { hash, flags },
        }
    }

    /// Whether two references point at the same cell with the same flags and
    /// the same in-memory availability.
    pub fn same_as(&self, other: &Self) -> bool {
        self.is_null() == other.is_null()
            && self.is_direct() == other.is_direct()
            && self.hash() == other.hash()
            && self.flags() == other.flags()
    }
}

impl<C> Clone for Ref<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Direct { cell, hash, flags } => Self::Direct {
                cell: Arc::clone(cell),
                hash: *hash,
                flags: *flags,
            },
            Self::Stub { hash, flags } => Self::Stub {
                hash: *hash,
                flags: *flags,
            },
        }
    }
}

impl<C> fmt::Debug for Ref<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Ref::Null"),
            Self::Direct { hash, flags, .. } => write!(f, "Ref::Direct({hash:?}, {flags:?})"),
            Self::Stub { hash, flags } => write!(f, "Ref::Stub({hash:?}, {flags:?})"),
        }
    }
}
