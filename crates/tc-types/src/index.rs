//! Numpy-style indexing.
//!
//! An [`Index`] is a list of [`IndexEntry`] values, one per leading axis.
//! For a tensor the first entry addresses the sample axis; the remaining
//! entries (the "sub-index") are applied to the decoded sample.

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

/// One axis of an index expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexEntry {
    /// A single position. Collapses the axis. Negative values count from the end.
    Int(i64),
    /// A `start:stop:step` range. Keeps the axis.
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl IndexEntry {
    /// The full range `:`.
    pub const fn all() -> Self {
        Self::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }

    pub const fn range(start: i64, stop: i64) -> Self {
        Self::Slice {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    /// Concrete positions selected on an axis of length `len`.
    pub fn positions(&self, axis: usize, len: usize) -> TypeResult<Vec<usize>> {
        match *self {
            Self::Int(i) => {
                let resolved = if i < 0 { i + len as i64 } else { i };
                if resolved < 0 || resolved >= len as i64 {
                    return Err(TypeError::IndexOutOfBounds {
                        index: i,
                        axis,
                        size: len,
                    });
                }
                Ok(vec![resolved as usize])
            }
            Self::Slice { start, stop, step } => slice_indices(len, start, stop, step),
        }
    }
}

impl From<i64> for IndexEntry {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<std::ops::Range<i64>> for IndexEntry {
    fn from(value: std::ops::Range<i64>) -> Self {
        Self::range(value.start, value.end)
    }
}

/// A full index expression. The first entry addresses samples.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub values: Vec<IndexEntry>,
}

impl Index {
    /// Index selecting a single sample.
    pub fn sample(i: u64) -> Self {
        Self {
            values: vec![IndexEntry::Int(i as i64)],
        }
    }

    pub fn new(values: Vec<IndexEntry>) -> Self {
        Self { values }
    }

    /// Append an entry (builder style).
    pub fn with(mut self, entry: impl Into<IndexEntry>) -> Self {
        self.values.push(entry.into());
        self
    }

    /// Entries after the sample axis.
    pub fn sub_index(&self) -> &[IndexEntry] {
        self.values.get(1..).unwrap_or(&[])
    }

    /// Entry for the sample axis, if any.
    pub fn sample_entry(&self) -> Option<&IndexEntry> {
        self.values.first()
    }
}

/// Resolve a slice against an axis of length `len`, with Python's
/// `slice.indices` clamping rules.
pub fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> TypeResult<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(TypeError::ZeroStep);
    }
    let len = len as i64;
    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };

    let clamp = |value: Option<i64>, default: i64| match value {
        None => default,
        Some(v) if v < 0 => (v + len).max(lower),
        Some(v) => v.min(upper),
    };
    let start = clamp(start, if step > 0 { lower } else { upper });
    let stop = clamp(stop, if step > 0 { upper } else { lower });

    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i += step;
    }
    Ok(out)
}
