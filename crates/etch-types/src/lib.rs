//! Foundation types for the Etch content-addressed store.
//!
//! Every other Etch crate depends on `etch-types`.
//!
//! # Key Types
//!
//! - [`Hash`] -- 32-byte content identifier (BLAKE3 digest), the key of every record
//! - [`Status`] -- Durability level a value has reached in a store
//! - [`Flags`] -- The per-record flags byte: a status nibble plus marker bits

pub mod error;
pub mod hash;
pub mod status;

pub use error::TypeError;
pub use hash::Hash;
pub use status::{Flags, Status};
