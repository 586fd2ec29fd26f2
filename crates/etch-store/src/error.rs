use etch_core::EtchError;
use etch_types::Hash;

/// Errors from cell store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Error from the underlying Etch engine.
    #[error(transparent)]
    Etch(#[from] EtchError),

    /// A cell could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A referenced cell is not present in the store.
    #[error("missing data for {0}")]
    MissingData(Hash),

    /// Stored bytes do not hash to the key they are stored under.
    #[error("hash mismatch: stored under {expected}, content hashes to {computed}")]
    HashMismatch { expected: Hash, computed: Hash },

    /// `start_gc` was called while a collection is already running.
    #[error("garbage collection already in progress")]
    GcInProgress,

    /// `finish_gc` was called without a matching `start_gc`.
    #[error("no garbage collection in progress")]
    GcNotStarted,

    /// The new file is not ready to replace the old one.
    #[error("garbage collection incomplete: {0}")]
    GcIncomplete(String),
}

impl StoreError {
    /// Whether the store should be treated as unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Etch(e) => e.is_fatal(),
            Self::HashMismatch { .. } => true,
            _ => false,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
