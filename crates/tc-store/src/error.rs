/// Errors from storage and cache operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored data is malformed or cannot be decoded.
    #[error("corrupt object at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// A cached object was requested with a different type than it holds.
    #[error("cached object at {0} has a different type")]
    TypeMismatch(String),

    /// The key cannot be mapped onto the backend.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The cache was opened read-only.
    #[error("store is read-only")]
    ReadOnly,
}

impl StoreError {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
