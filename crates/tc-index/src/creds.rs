//! Sample index to credential id, per tensor commit.

use serde::{Deserialize, Serialize};
use tc_store::{CacheObject, StoreResult};

use crate::error::IndexResult;
use crate::rle::RunLengthIndex;

/// Credential id assigned to each sample of a linked tensor.
///
/// Ids are interned by the dataset's credential registry; `0` is the
/// "no credential" key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredsEncoder {
    ids: RunLengthIndex<u32>,
}

impl CredsEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_samples(&self) -> u64 {
        self.ids.len()
    }

    pub fn register_samples(&mut self, creds_id: u32, count: u64) {
        self.ids.append(creds_id, count);
    }

    pub fn get_encoded_creds_key(&self, index: u64) -> IndexResult<u32> {
        self.ids.lookup(index).copied()
    }

    /// Reassign the credential of one sample.
    pub fn set(&mut self, index: u64, creds_id: u32) -> IndexResult<()> {
        self.ids.set(index, creds_id)
    }

    pub fn pop(&mut self, count: u64) -> IndexResult<()> {
        self.ids.pop(count)
    }

    pub fn num_runs(&self) -> usize {
        self.ids.num_runs()
    }
}

impl CacheObject for CredsEncoder {
    fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(self.ids.to_bytes()?)
    }

    fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Ok(Self {
            ids: RunLengthIndex::from_bytes(bytes)?,
        })
    }
}
