use tc_types::TypeError;
use thiserror::Error;

use crate::compression::{Compression, CompressionMode};

/// Errors produced by the compression layer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The name matches neither a canonical compression nor an alias.
    #[error("unsupported compression: {0}")]
    UnknownCompression(String),

    /// The compression cannot be used at this granularity.
    #[error("{compression} does not support {mode} compression")]
    UnsupportedMode {
        compression: Compression,
        mode: CompressionMode,
    },

    /// The sample's dtype or shape violates the codec's constraints.
    #[error("{compression} cannot encode this sample: {reason}")]
    Constraint {
        compression: Compression,
        reason: String,
    },

    #[error("{compression} encoding failed: {reason}")]
    Encode {
        compression: Compression,
        reason: String,
    },

    #[error("{compression} decoding failed: {reason}")]
    Decode {
        compression: Compression,
        reason: String,
    },

    /// Audio/video work was requested but no media backend is installed.
    #[error("no media backend installed for {0}")]
    NoMediaBackend(Compression),

    /// A headerless codec was asked to decode without a known shape.
    #[error("{0} payloads need a known shape to decode")]
    MissingShape(Compression),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl CodecError {
    pub(crate) fn encode(compression: Compression, err: impl std::fmt::Display) -> Self {
        Self::Encode {
            compression,
            reason: err.to_string(),
        }
    }

    pub(crate) fn decode(compression: Compression, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            compression,
            reason: err.to_string(),
        }
    }

    pub(crate) fn constraint(compression: Compression, reason: impl Into<String>) -> Self {
        Self::Constraint {
            compression,
            reason: reason.into(),
        }
    }
}

/// Convenience alias for codec results.
pub type CodecResult<T> = Result<T, CodecError>;
