//! Local sample index to byte range, kept inside each chunk.

use crate::error::IndexResult;
use crate::rle::RunLengthIndex;

/// Byte sizes of the samples in one chunk.
///
/// Samples are laid out back to back, so a sample's start is the sum of the
/// sizes before it. Runs of equally sized samples (fixed-shape raw data) make
/// that sum cheap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BytePositionsEncoder {
    sizes: RunLengthIndex<u64>,
}

impl BytePositionsEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_runs(runs: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self {
            sizes: RunLengthIndex::from_runs(runs),
        }
    }

    pub fn num_samples(&self) -> u64 {
        self.sizes.len()
    }

    /// Total bytes covered.
    pub fn num_bytes(&self) -> u64 {
        self.sizes.runs().map(|(size, count)| size * count).sum()
    }

    pub fn register(&mut self, nbytes: u64) {
        self.sizes.append(nbytes, 1);
    }

    /// `[start, end)` of sample `local`.
    pub fn range(&self, local: u64) -> IndexResult<(u64, u64)> {
        let (run, offset) = self.sizes.translate(local)?;
        let before: u64 = self.sizes.runs().take(run).map(|(s, c)| s * c).sum();
        let size = self.sizes.value(run).copied().unwrap_or_default();
        let start = before + offset * size;
        Ok((start, start + size))
    }

    pub fn runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.sizes.runs().map(|(s, c)| (*s, c))
    }

    pub fn pop(&mut self, count: u64) -> IndexResult<()> {
        self.sizes.pop(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_contiguous() {
        let mut enc = BytePositionsEncoder::new();
        enc.register(10);
        enc.register(10);
        enc.register(4);
        enc.register(0);
        assert_eq!(enc.range(0).unwrap(), (0, 10));
        assert_eq!(enc.range(1).unwrap(), (10, 20));
        assert_eq!(enc.range(2).unwrap(), (20, 24));
        assert_eq!(enc.range(3).unwrap(), (24, 24));
        assert_eq!(enc.num_bytes(), 24);
    }

    #[test]
    fn pop_shrinks_total() {
        let mut enc = BytePositionsEncoder::from_runs([(8, 3), (2, 1)]);
        enc.pop(2).unwrap();
        assert_eq!(enc.num_bytes(), 16);
        assert_eq!(enc.num_samples(), 2);
    }
}
