use std::collections::BTreeSet;

use tc_codec::{CodecError, Compression, CompressionMode};
use tc_index::IndexError;
use tc_store::StoreError;
use tc_types::{DType, TypeError};

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ---- configuration ----
    /// A compression name that is neither canonical nor an alias.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    #[error("unknown htype: {0}")]
    UnknownHtype(String),

    /// The htype needs a value the tensor config did not supply.
    #[error("htype {htype} requires {key}")]
    MissingRequiredValue { htype: String, key: String },

    #[error("sample_compression and chunk_compression are mutually exclusive")]
    MutuallyExclusiveCompression,

    #[error("{compression} cannot be used as {mode} compression")]
    UnsupportedCompressionMode {
        compression: Compression,
        mode: CompressionMode,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    // ---- encode ----
    /// The sample violates the tensor's codec constraints.
    #[error("sample compression failed: {0}")]
    SampleCompression(#[from] CodecError),

    #[error("dtype mismatch: tensor is {expected}, sample is {actual}")]
    DTypeMismatch { expected: DType, actual: DType },

    #[error("sample has {actual} dimensions, tensor samples have {expected}")]
    ShapeDimMismatch { expected: usize, actual: usize },

    // ---- link integrity ----
    #[error("expected {expected}, got {actual} instead")]
    UnexpectedSampleType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("linked sample {path} could not be verified: {reason}")]
    LinkVerification { path: String, reason: String },

    #[error("creds keys {} are used in the data but not populated", fmt_keys(.0))]
    LinkNotReady(BTreeSet<String>),

    // ---- credentials ----
    #[error("creds key {0} has not been populated")]
    MissingCreds(String),

    #[error("creds key {0} does not exist")]
    UnknownCredsKey(String),

    #[error("creds key {0} already exists")]
    DuplicateCredsKey(String),

    #[error("no creds key is encoded as {0}")]
    UnknownCredsId(u32),

    #[error("no storage client available for {0}")]
    UnsupportedProvider(String),

    // ---- tensor lifecycle ----
    #[error("tensor {0} does not exist")]
    TensorNotFound(String),

    #[error("tensor {0} already exists")]
    TensorExists(String),

    #[error("index {index} is out of range for tensor of length {len}")]
    IndexOutOfRange { index: u64, len: u64 },

    #[error("cannot pop: {0}")]
    CannotPop(String),

    #[error("corrupt data at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    // ---- lower layers ----
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_keys(keys: &BTreeSet<String>) -> String {
    let quoted: Vec<String> = keys.iter().map(|k| format!("'{k}'")).collect();
    format!("{{{}}}", quoted.join(", "))
}

impl EngineError {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_read_only())
    }
}

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
