//! Sample index to chunk id.

use serde::{Deserialize, Serialize};
use tc_store::{CacheObject, StoreResult};

use crate::error::{IndexError, IndexResult};
use crate::rle::RunLengthIndex;

/// Opaque chunk identifier.
pub type ChunkId = u64;

/// Maps every sample of a tensor commit onto the chunk that stores it.
///
/// Each chunk covers one contiguous run of samples, so the number of runs
/// equals the number of chunks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIdEncoder {
    ids: RunLengthIndex<ChunkId>,
}

impl ChunkIdEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh random chunk id.
    pub fn generate_id() -> ChunkId {
        loop {
            let id = rand::random::<u64>();
            if id != 0 {
                return id;
            }
        }
    }

    /// Storage name of a chunk id (fixed-width hex).
    pub fn name_of(id: ChunkId) -> String {
        hex::encode(id.to_be_bytes())
    }

    pub fn id_from_name(name: &str) -> IndexResult<ChunkId> {
        let bytes = hex::decode(name).map_err(|_| IndexError::InvalidChunkName(name.into()))?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| IndexError::InvalidChunkName(name.into()))?;
        Ok(u64::from_be_bytes(arr))
    }

    pub fn num_samples(&self) -> u64 {
        self.ids.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.ids.num_runs()
    }

    /// Record that `count` more samples were stored in chunk `id`.
    pub fn register_samples(&mut self, id: ChunkId, count: u64) {
        self.ids.append(id, count);
    }

    /// Chunk id holding `index` and the sample's position inside that chunk.
    pub fn translate_index_relative_to_chunks(&self, index: u64) -> IndexResult<(ChunkId, u64)> {
        let (run, local) = self.ids.translate(index)?;
        Ok((self.ids.value(run).copied().unwrap_or_default(), local))
    }

    pub fn chunk_id(&self, index: u64) -> IndexResult<ChunkId> {
        self.ids.lookup(index).copied()
    }

    pub fn last_chunk_id(&self) -> Option<ChunkId> {
        self.ids.last().copied()
    }

    /// Samples stored in the last chunk.
    pub fn samples_in_last_chunk(&self) -> u64 {
        match self.ids.num_runs() {
            0 => 0,
            n => self.ids.run_len(n - 1),
        }
    }

    /// `(chunk id, sample count)` for every chunk, in order.
    pub fn chunks(&self) -> impl Iterator<Item = (ChunkId, u64)> + '_ {
        self.ids.runs().map(|(id, count)| (*id, count))
    }

    /// Point the samples of the last chunk at a different chunk id.
    pub fn replace_last_chunk_id(&mut self, id: ChunkId) -> IndexResult<()> {
        let count = self.samples_in_last_chunk();
        self.ids.pop(count)?;
        self.ids.append(id, count);
        Ok(())
    }

    pub fn pop(&mut self, count: u64) -> IndexResult<()> {
        self.ids.pop(count)
    }
}

impl CacheObject for ChunkIdEncoder {
    fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(self.ids.to_bytes()?)
    }

    fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Ok(Self {
            ids: RunLengthIndex::from_bytes(bytes)?,
        })
    }
}
