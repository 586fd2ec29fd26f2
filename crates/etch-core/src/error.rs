use etch_types::Hash;

/// Errors from Etch engine operations.
///
/// Only a subset is recoverable: see [`EtchError::is_fatal`]. Fatal errors
/// mean the file is corrupt or an internal invariant broke, and the engine
/// refuses further writes once one has been raised during a write.
#[derive(Debug, thiserror::Error)]
pub enum EtchError {
    /// I/O error from the underlying file or mapping.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with the Etch magic number.
    #[error("invalid Etch header: expected magic {expected:#06x}, found {actual:#06x}")]
    InvalidHeader { expected: u16, actual: u16 },

    /// The file was written by an unsupported format version.
    #[error("unsupported Etch version: {0}")]
    UnsupportedVersion(u16),

    /// Another process holds the advisory lock on the file.
    #[error("file is locked by another process: {0}")]
    Locked(String),

    /// The on-disk structure is inconsistent.
    #[error("corrupt Etch file at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    /// Descent went past the deepest possible radix level.
    #[error("maximum index depth exceeded while inserting {0}")]
    MaxLevelExceeded(Hash),

    /// An internal invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A record with an empty payload was submitted.
    #[error("zero-length payload for {0}")]
    EmptyPayload(Hash),

    /// A payload longer than a record can hold was submitted.
    #[error("payload of {0} bytes exceeds the record limit of 65535")]
    PayloadTooLarge(usize),

    /// A key was not exactly 32 bytes.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// The engine has been closed.
    #[error("Etch store is closed")]
    Closed,

    /// A previous fatal error left the engine unusable.
    #[error("Etch store is unusable after a fatal error")]
    Poisoned,
}

impl EtchError {
    /// Whether this error indicates corruption or a broken invariant.
    ///
    /// Fatal errors are never retryable; the owner should stop using the
    /// store.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidHeader { .. }
                | Self::UnsupportedVersion(_)
                | Self::Locked(_)
                | Self::Corruption { .. }
                | Self::MaxLevelExceeded(_)
                | Self::Invariant(_)
                | Self::EmptyPayload(_)
                | Self::Poisoned
        )
    }

    pub(crate) fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            reason: reason.into(),
        }
    }
}

/// Result alias for engine operations.
pub type EtchResult<T> = Result<T, EtchError>;
