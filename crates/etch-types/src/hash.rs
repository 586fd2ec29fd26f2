use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content hash identifying a stored value.
///
/// A `Hash` is the BLAKE3 digest of a value's encoding. It is also the key
/// under which the value is recorded in an Etch file, so its bytes drive the
/// radix descent: the leading bytes are assumed to be uniformly distributed.
#[derive(Clone, Copy, PartialEq, Eq, std::hash::Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Length of a hash in bytes.
    pub const LENGTH: usize = 32;

    /// The all-zero hash. Used as the "no root" marker in a fresh file.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Compute the hash of an encoding.
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a pre-computed 32-byte hash.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Copy a hash out of a slice, which must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: Self::LENGTH,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// A uniformly random hash, for tests and benchmarks.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Returns `true` for the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(Hash::digest(b"hello world"), Hash::digest(b"hello world"));
        assert_ne!(Hash::digest(b"hello"), Hash::digest(b"world"));
    }

    #[test]
    fn zero_is_all_zeros() {
        assert!(Hash::ZERO.is_zero());
        assert!(!Hash::digest(b"x").is_zero());
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        let err = Hash::from_slice(&[1u8; 31]).unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 31
            }
        );
        assert!(Hash::from_slice(&[1u8; 33]).is_err());
        assert!(Hash::from_slice(&[1u8; 32]).is_ok());
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(matches!(
            Hash::from_hex("zz"),
            Err(TypeError::InvalidHex(_))
        ));
        assert!(matches!(
            Hash::from_hex("abcd"),
            Err(TypeError::InvalidLength { .. })
        ));
    }

    #[test]
    fn display_is_full_hex() {
        let h = Hash::digest(b"test");
        let display = format!("{h}");
        assert_eq!(display.len(), 64);
        assert_eq!(h.short_hex().len(), 8);
    }

    #[test]
    fn serde_roundtrip() {
        let h = Hash::digest(b"serde test");
        let json = serde_json::to_string(&h).unwrap();
        let parsed: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, parsed);
    }

    proptest! {
        #[test]
        fn hex_roundtrip(bytes in any::<[u8; 32]>()) {
            let h = Hash::from_bytes(bytes);
            prop_assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
        }
    }
}
