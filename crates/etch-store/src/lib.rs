//! Persistence façade over Etch files.
//!
//! Values are [`Cell`]s: content-addressed nodes of a graph whose key is the
//! BLAKE3 hash of their encoding. A store brings a value up to a required
//! durability [`Status`](etch_types::Status), storing its reachable children
//! first when the status demands it, and tracks one "current root" value.
//!
//! # Storage Backends
//!
//! All backends implement the [`CellStore`] trait:
//!
//! - [`EtchStore`] -- an Etch file with an LRU cache and copy-forward
//!   garbage collection
//! - [`InMemoryCellStore`] -- `HashMap`-based store for tests and embedding
//!
//! # Design Rules
//!
//! 1. Cells are immutable once written; only their flags move upward.
//! 2. Children before parents: a `Persisted` cell never points at a missing
//!    child.
//! 3. Embedded cells travel inside their parents and are not stored on their
//!    own unless stored as a top-level value.
//! 4. The root pointer is updated only after the root graph is flushed.

pub mod cell;
pub mod config;
pub mod error;
pub mod etch;
pub mod memory;
pub mod persist;
pub mod reference;
pub mod traits;

pub use cell::{Cell, DataCell, EMBED_LIMIT};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use etch::EtchStore;
pub use memory::InMemoryCellStore;
pub use persist::Novelty;
pub use reference::Ref;
pub use traits::CellStore;
