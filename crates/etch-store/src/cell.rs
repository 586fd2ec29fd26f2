//! The cell abstraction stored by the façade, and [`DataCell`], a simple
//! byte-tree implementation of it.

use std::sync::Arc;

use etch_types::{Flags, Hash};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::reference::Ref;

/// A value that can be stored by content hash.
///
/// The content hash of a cell is the BLAKE3 digest of [`encode`](Cell::encode).
/// Encodings must be deterministic, must be non-empty, and must not change
/// when [`with_child_refs`](Cell::with_child_refs) swaps in references to
/// the same children.
pub trait Cell: Sized + Send + Sync + 'static {
    fn encode(&self) -> StoreResult<Vec<u8>>;

    fn decode(bytes: &[u8]) -> StoreResult<Self>;

    /// Whether this cell is inlined into the encodings of its parents rather
    /// than stored on its own.
    fn is_embedded(&self) -> bool;

    /// Approximate in-memory footprint, recorded as record size metadata.
    fn memory_size(&self) -> u64;

    /// References to child cells, in encoding order.
    fn child_refs(&self) -> Vec<Ref<Self>> {
        Vec::new()
    }

    /// A copy of this cell whose children are replaced, in order, by
    /// `children`.
    fn with_child_refs(&self, children: Vec<Ref<Self>>) -> Self;
}

/// Leaves up to this many bytes are embedded in their parents.
pub const EMBED_LIMIT: usize = 48;

/// A tree of byte strings: the reference [`Cell`] implementation.
#[derive(Clone, Debug)]
pub enum DataCell {
    Leaf(Vec<u8>),
    Branch(Vec<Ref<DataCell>>),
}

#[derive(Serialize, Deserialize)]
enum Wire {
    Leaf(Vec<u8>),
    Branch(Vec<WireChild>),
}

#[derive(Serialize, Deserialize)]
enum WireChild {
    Null,
    Inline(Vec<u8>),
    Hash(Hash),
}

impl DataCell {
    pub fn leaf(data: impl Into<Vec<u8>>) -> Self {
        Self::Leaf(data.into())
    }

    pub fn branch(children: Vec<Ref<DataCell>>) -> Self {
        Self::Branch(children)
    }

    /// Leaf bytes, if this is a leaf.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Leaf(data) => Some(data),
            Self::Branch(_) => None,
        }
    }

    fn to_wire(&self) -> StoreResult<Wire> {
        Ok(match self {
            Self::Leaf(data) => Wire::Leaf(data.clone()),
            Self::Branch(children) => Wire::Branch(
                children
                    .iter()
                    .map(|child| match child {
                        Ref::Null => Ok(WireChild::Null),
                        Ref::Direct { cell, .. } if cell.is_embedded() => {
                            Ok(WireChild::Inline(cell.encode()?))
                        }
                        other => Ok(WireChild::Hash(other.hash())),
                    })
                    .collect::<StoreResult<Vec<_>>>()?,
            ),
        })
    }
}

impl Cell for DataCell {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(&self.to_wire()?).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let wire: Wire =
            bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        match wire {
            Wire::Leaf(data) => Ok(Self::Leaf(data)),
            Wire::Branch(children) => children
                .into_iter()
                .map(|child| match child {
                    WireChild::Null => Ok(Ref::Null),
                    WireChild::Inline(bytes) => {
                        let cell = Self::decode(&bytes)?;
                        Ok(Ref::Direct {
                            cell: Arc::new(cell),
                            hash: Hash::digest(&bytes),
                            flags: Flags::default().insert(Flags::EMBEDDED),
                        })
                    }
                    WireChild::Hash(hash) => Ok(Ref::Stub {
                        hash,
                        flags: Flags::default().insert(Flags::NON_EMBEDDED),
                    }),
                })
                .collect::<StoreResult<Vec<_>>>()
                .map(Self::Branch),
        }
    }

    fn is_embedded(&self) -> bool {
        matches!(self, Self::Leaf(data) if data.len() <= EMBED_LIMIT)
    }

    fn memory_size(&self) -> u64 {
        let own = std::mem::size_of::<Self>();
        let extra = match self {
            Self::Leaf(data) => data.len(),
            Self::Branch(children) => children.len() * std::mem::size_of::<Ref<Self>>(),
        };
        (own + extra) as u64
    }

    fn child_refs(&self) -> Vec<Ref<Self>> {
        match self {
            Self::Leaf(_) => Vec::new(),
            Self::Branch(children) => children.clone(),
        }
    }

    fn with_child_refs(&self, children: Vec<Ref<Self>>) -> Self {
        match self {
            Self::Leaf(data) => Self::Leaf(data.clone()),
            Self::Branch(_) => Self::Branch(children),
        }
    }
}
