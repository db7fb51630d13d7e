//! Error types for the index crate.

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A lookup past the end of the indexed domain.
    #[error("index {index} is out of range for {len} entries")]
    OutOfRange { index: u64, len: u64 },

    /// More entries were popped than exist.
    #[error("cannot pop {requested} entries, only {len} present")]
    CannotPop { requested: u64, len: u64 },

    /// A chunk name that is not a hex-encoded id.
    #[error("invalid chunk name: {0}")]
    InvalidChunkName(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<IndexError> for tc_store::StoreError {
    fn from(err: IndexError) -> Self {
        tc_store::StoreError::Serialization(err.to_string())
    }
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
