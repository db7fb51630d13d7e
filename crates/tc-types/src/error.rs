use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("unknown dtype: {0}")]
    UnknownDType(String),

    #[error("shape {shape:?} needs {expected} bytes, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("cannot safely cast {value} from {from} to {to}")]
    UnsafeCast {
        value: String,
        from: String,
        to: String,
    },

    #[error("expected element type {expected}, array holds {actual}")]
    ElementType { expected: String, actual: String },

    #[error("too many indices: array has {ndim} dimensions, got {given}")]
    TooManyIndices { ndim: usize, given: usize },

    #[error("index {index} is out of bounds for axis {axis} with size {size}")]
    IndexOutOfBounds { index: i64, axis: usize, size: usize },

    #[error("slice step cannot be zero")]
    ZeroStep,

    #[error("ragged nested list: {0}")]
    Ragged(String),

    #[error("unsupported value in nested list: {0}")]
    UnsupportedValue(String),
}

/// Convenience alias for type results.
pub type TypeResult<T> = Result<T, TypeError>;
