//! Etch: an append-only, memory-mapped key-value file keyed by 256-bit
//! content hashes.
//!
//! An Etch file holds a radix tree of index blocks over immutable data
//! records. Keys are hashes, so their leading bytes are uniformly
//! distributed and the tree stays shallow: the level-0 block resolves the
//! first two key bytes in one step.
//!
//! # Components
//!
//! - [`RegionManager`] -- maps the file in 1 GiB windows that grow by
//!   doubling, handing out independently positioned views
//! - [`Etch`] -- the radix-tree engine: descent, collision chaining, chain
//!   collapse, in-place flag upgrades, header and root hash
//! - [`IndexVisitor`] / [`IndexValidator`] -- read-only index traversal for
//!   audit tooling
//! - [`ShutdownRegistry`] / [`install_shutdown_hook`] -- closes registered
//!   engines when the process receives a termination signal
//!
//! # Design Rules
//!
//! 1. A key, once written, is never moved or rewritten. Only its flags and
//!    size metadata may be upgraded in place.
//! 2. The data length only grows.
//! 3. Each key resolves to at most one data record.
//! 4. One writer at a time; readers never block on the writer.
//! 5. Structural inconsistencies are fatal and poison the store.

pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod region;
pub mod shutdown;
pub mod visitor;

pub use config::EtchConfig;
pub use engine::{Etch, WriteResult};
pub use error::{EtchError, EtchResult};
pub use format::{Header, Record, Slot, SlotKind, MAX_LEVEL, MAX_PAYLOAD_SIZE};
pub use region::{RegionManager, RegionView};
pub use shutdown::{install_shutdown_hook, ShutdownRegistry};
pub use visitor::{IndexBlock, IndexValidator, IndexVisitor, Issue, IssueKind, ValidationReport};
