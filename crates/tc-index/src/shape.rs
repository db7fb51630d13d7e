//! Local sample index to shape, kept inside each chunk.

use crate::error::IndexResult;
use crate::rle::RunLengthIndex;

/// Shapes of the samples stored in one chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShapeEncoder {
    shapes: RunLengthIndex<Vec<usize>>,
}

impl ShapeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_runs(runs: impl IntoIterator<Item = (Vec<usize>, u64)>) -> Self {
        Self {
            shapes: RunLengthIndex::from_runs(runs),
        }
    }

    pub fn num_samples(&self) -> u64 {
        self.shapes.len()
    }

    pub fn register(&mut self, shape: &[usize]) {
        self.shapes.append(shape.to_vec(), 1);
    }

    pub fn shape(&self, local: u64) -> IndexResult<&[usize]> {
        self.shapes.lookup(local).map(Vec::as_slice)
    }

    pub fn runs(&self) -> impl Iterator<Item = (&Vec<usize>, u64)> + '_ {
        self.shapes.runs()
    }

    pub fn pop(&mut self, count: u64) -> IndexResult<()> {
        self.shapes.pop(count)
    }
}
