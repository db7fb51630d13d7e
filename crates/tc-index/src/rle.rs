//! The generic run-length map.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Maps the contiguous domain `[0, len)` onto values stored as runs.
///
/// Runs are kept as parallel vectors of values and cumulative (exclusive)
/// end positions, so a lookup is a binary search over run boundaries and
/// costs `O(log runs)` regardless of how many samples are covered.
/// Adjacent runs never hold equal values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLengthIndex<V> {
    values: Vec<V>,
    ends: Vec<u64>,
}

impl<V> Default for RunLengthIndex<V> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            ends: Vec::new(),
        }
    }
}

impl<V: Clone + PartialEq> RunLengthIndex<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(value, count)` pairs. Zero counts are skipped and equal
    /// neighbours merged.
    pub fn from_runs(runs: impl IntoIterator<Item = (V, u64)>) -> Self {
        let mut index = Self::new();
        for (value, count) in runs {
            index.append(value, count);
        }
        index
    }

    /// Number of indexed positions.
    pub fn len(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_runs(&self) -> usize {
        self.values.len()
    }

    /// Extend the domain with `count` copies of `value`.
    pub fn append(&mut self, value: V, count: u64) {
        if count == 0 {
            return;
        }
        let end = self.len() + count;
        match self.values.last() {
            Some(last) if *last == value => {
                if let Some(e) = self.ends.last_mut() {
                    *e = end;
                }
            }
            _ => {
                self.values.push(value);
                self.ends.push(end);
            }
        }
    }

    /// Run containing position `index`.
    pub fn find_run(&self, index: u64) -> IndexResult<usize> {
        if index >= self.len() {
            return Err(IndexError::OutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(self.ends.partition_point(|&end| end <= index))
    }

    pub fn lookup(&self, index: u64) -> IndexResult<&V> {
        let run = self.find_run(index)?;
        Ok(&self.values[run])
    }

    /// Resolve `index` to its run and its offset from the start of that run.
    pub fn translate(&self, index: u64) -> IndexResult<(usize, u64)> {
        let run = self.find_run(index)?;
        Ok((run, index - self.run_start(run)))
    }

    /// First position covered by `run`.
    pub fn run_start(&self, run: usize) -> u64 {
        if run == 0 {
            0
        } else {
            self.ends[run - 1]
        }
    }

    pub fn run_len(&self, run: usize) -> u64 {
        self.ends[run] - self.run_start(run)
    }

    pub fn value(&self, run: usize) -> Option<&V> {
        self.values.get(run)
    }

    pub fn last(&self) -> Option<&V> {
        self.values.last()
    }

    /// `(value, count)` pairs in order.
    pub fn runs(&self) -> impl Iterator<Item = (&V, u64)> + '_ {
        (0..self.values.len()).map(move |run| (&self.values[run], self.run_len(run)))
    }

    /// Overwrite the value at a single position, splitting its run.
    pub fn set(&mut self, index: u64, value: V) -> IndexResult<()> {
        let run = self.find_run(index)?;
        if self.values[run] == value {
            return Ok(());
        }
        let start = self.run_start(run);
        let end = self.ends[run];
        let old = self.values[run].clone();

        let mut values = Vec::with_capacity(3);
        let mut ends = Vec::with_capacity(3);
        if index > start {
            values.push(old.clone());
            ends.push(index);
        }
        values.push(value);
        ends.push(index + 1);
        if index + 1 < end {
            values.push(old);
            ends.push(end);
        }
        self.values.splice(run..=run, values);
        self.ends.splice(run..=run, ends);
        self.coalesce();
        Ok(())
    }

    /// Drop the last `count` positions.
    pub fn pop(&mut self, count: u64) -> IndexResult<()> {
        let len = self.len();
        if count > len {
            return Err(IndexError::CannotPop {
                requested: count,
                len,
            });
        }
        let target = len - count;
        while let Some(last) = self.values.len().checked_sub(1) {
            if self.run_start(last) < target {
                break;
            }
            self.values.pop();
            self.ends.pop();
        }
        if let Some(end) = self.ends.last_mut() {
            *end = target;
        }
        Ok(())
    }

    fn coalesce(&mut self) {
        let mut k = 0;
        while k + 1 < self.values.len() {
            if self.values[k] == self.values[k + 1] {
                self.values.remove(k);
                self.ends.remove(k);
            } else {
                k += 1;
            }
        }
    }
}

impl<V: Clone + PartialEq + Serialize + DeserializeOwned> RunLengthIndex<V> {
    pub fn to_bytes(&self) -> IndexResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> IndexResult<Self> {
        let index: Self = bincode::deserialize(bytes)?;
        if index.values.len() != index.ends.len() || index.ends.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(IndexError::Serialization(
                "run boundaries are not strictly increasing".into(),
            ));
        }
        Ok(index)
    }
}
