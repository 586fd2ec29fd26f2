use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Durability level a value has reached.
///
/// Levels are ordered: a store holding a value at `Persisted` also satisfies
/// any request for `Stored`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    /// Nothing is known about the value's presence in any store.
    Unknown = 0,
    /// The value's own encoding is in the store; children may be missing.
    Stored = 1,
    /// The value and everything reachable from it are in the store.
    Persisted = 2,
    /// Persisted and announced to peers.
    Announced = 3,
    /// Persisted and pinned as internal node state.
    Internal = 4,
}

impl Status {
    /// Whether this level requires every reachable child to be stored too.
    pub fn requires_children(self) -> bool {
        self >= Status::Persisted
    }

    /// Convert from the low nibble of a flags byte.
    pub fn from_u8(value: u8) -> Result<Self, TypeError> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Stored),
            2 => Ok(Self::Persisted),
            3 => Ok(Self::Announced),
            4 => Ok(Self::Internal),
            other => Err(TypeError::InvalidStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Stored => write!(f, "stored"),
            Self::Persisted => write!(f, "persisted"),
            Self::Announced => write!(f, "announced"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// The flags byte carried by every data record.
///
/// Layout:
/// ```text
/// bit 7      bit 6     bit 5         bit 4     bits 3..0
/// [invalid] [verified] [non-embedded] [embedded] [status]
/// ```
///
/// Merging takes the higher status and ORs the marker bits, so flags only
/// ever move upward when a record is rewritten.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags(u8);

impl Flags {
    pub const STATUS_MASK: u8 = 0x0F;
    /// The value is known to be embedded in its parents' encodings.
    pub const EMBEDDED: u8 = 0x10;
    /// The value is known to need standalone storage.
    pub const NON_EMBEDDED: u8 = 0x20;
    /// The encoding has been validated.
    pub const VERIFIED: u8 = 0x40;
    /// The encoding failed validation.
    pub const INVALID: u8 = 0x80;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Flags carrying only a status.
    pub const fn with_status(status: Status) -> Self {
        Self(status as u8)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// The status nibble. Values above `Internal` decode as `Unknown`.
    pub fn status(self) -> Status {
        Status::from_u8(self.0 & Self::STATUS_MASK).unwrap_or(Status::Unknown)
    }

    /// Replace the status nibble, keeping marker bits.
    pub fn set_status(self, status: Status) -> Self {
        Self((self.0 & !Self::STATUS_MASK) | status as u8)
    }

    /// Add marker bits.
    pub fn insert(self, marker: u8) -> Self {
        Self(self.0 | (marker & !Self::STATUS_MASK))
    }

    pub fn contains(self, marker: u8) -> bool {
        self.0 & marker == marker
    }

    /// Upgrade-only merge: the higher status wins, marker bits accumulate.
    pub fn merge(self, other: Flags) -> Flags {
        let status = self.status().max(other.status());
        let markers = (self.0 | other.0) & !Self::STATUS_MASK;
        Self(markers | status as u8)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({}, {:#04x})", self.status(), self.0 & !Self::STATUS_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering() {
        assert!(Status::Unknown < Status::Stored);
        assert!(Status::Stored < Status::Persisted);
        assert!(Status::Persisted < Status::Internal);
        assert!(!Status::Stored.requires_children());
        assert!(Status::Persisted.requires_children());
        assert!(Status::Announced.requires_children());
    }

    #[test]
    fn status_from_u8() {
        for s in [
            Status::Unknown,
            Status::Stored,
            Status::Persisted,
            Status::Announced,
            Status::Internal,
        ] {
            assert_eq!(Status::from_u8(s as u8).unwrap(), s);
        }
        assert_eq!(Status::from_u8(9), Err(TypeError::InvalidStatus(9)));
    }

    #[test]
    fn merge_takes_highest_status() {
        let a = Flags::with_status(Status::Persisted);
        let b = Flags::with_status(Status::Stored);
        assert_eq!(a.merge(b).status(), Status::Persisted);
        assert_eq!(b.merge(a).status(), Status::Persisted);
    }

    #[test]
    fn merge_accumulates_markers() {
        let a = Flags::with_status(Status::Stored).insert(Flags::VERIFIED);
        let b = Flags::with_status(Status::Unknown).insert(Flags::NON_EMBEDDED);
        let merged = a.merge(b);
        assert!(merged.contains(Flags::VERIFIED));
        assert!(merged.contains(Flags::NON_EMBEDDED));
        assert!(!merged.contains(Flags::EMBEDDED));
        assert_eq!(merged.status(), Status::Stored);
    }

    #[test]
    fn insert_never_touches_status() {
        let f = Flags::with_status(Status::Announced).insert(0xFF);
        assert_eq!(f.status(), Status::Announced);
    }

    #[test]
    fn set_status_keeps_markers() {
        let f = Flags::with_status(Status::Stored)
            .insert(Flags::EMBEDDED)
            .set_status(Status::Internal);
        assert_eq!(f.status(), Status::Internal);
        assert!(f.contains(Flags::EMBEDDED));
    }
}
