//! The chunk engine: one tensor at one commit.
//!
//! Samples are appended to the open (last) chunk until it would exceed
//! `max_chunk_size`, then a new chunk is opened. Chunks inherited from a
//! parent commit are never mutated; the open chunk is copied first.

use std::sync::{Arc, RwLock};

use tc_codec::{CompressionMode, Pipeline};
use tc_index::{ChunkId, ChunkIdEncoder};
use tc_store::{keys, CacheObject, ObjectCache, Shared, StoreError};
use tc_types::{CommitId, DType, Index, IndexEntry, NdArray, Sample};
use tracing::{debug, info};

use crate::chunk::{Chunk, ChunkSet};
use crate::config::{EngineConfig, TensorConfig};
use crate::error::{EngineError, EngineResult};
use crate::meta::TensorMeta;
use crate::resolver::{EncodedSample, EngineContext, InlineResolver, ReadOptions, SampleResolver, StoredSample};

/// Engine over inline samples.
pub type InlineChunkEngine = ChunkEngine<InlineResolver>;

/// Sample placement, indexing, and byte accounting for one tensor commit.
pub struct ChunkEngine<R: SampleResolver> {
    key: String,
    commit_id: CommitId,
    cache: Arc<ObjectCache>,
    pipeline: Pipeline,
    resolver: R,
    meta: Shared<TensorMeta>,
    chunk_ids: Shared<ChunkIdEncoder>,
    chunk_set: Shared<ChunkSet>,
}

impl<R: SampleResolver> std::fmt::Debug for ChunkEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkEngine")
            .field("key", &self.key)
            .field("commit_id", &self.commit_id)
            .field("len", &self.len())
            .finish()
    }
}

fn apply_delta(total: u64, delta: i64) -> u64 {
    if delta >= 0 {
        total.saturating_add(delta as u64)
    } else {
        total.saturating_sub(delta.unsigned_abs())
    }
}

impl<R: SampleResolver> ChunkEngine<R> {
    /// Create a new, empty tensor.
    pub fn create(
        key: &str,
        commit_id: CommitId,
        cache: Arc<ObjectCache>,
        pipeline: Pipeline,
        resolver: R,
        config: &TensorConfig,
        defaults: &EngineConfig,
    ) -> EngineResult<Self> {
        cache.check_writable()?;
        let meta_key = keys::tensor_meta_key(key, commit_id.as_str());
        if cache.contains(&meta_key)? {
            return Err(EngineError::TensorExists(key.to_string()));
        }
        let meta = TensorMeta::new(config, defaults)?;
        resolver.accepts(&meta)?;

        let meta = cache.put_object(&meta_key, meta)?;
        let chunk_ids = cache.put_object(
            &keys::chunk_id_encoder_key(key, commit_id.as_str()),
            ChunkIdEncoder::new(),
        )?;
        let chunk_set = cache.put_object(
            &keys::chunk_set_key(key, commit_id.as_str()),
            ChunkSet::default(),
        )?;
        info!(tensor = key, commit = %commit_id, "tensor created");

        Ok(Self {
            key: key.to_string(),
            commit_id,
            cache,
            pipeline,
            resolver,
            meta,
            chunk_ids,
            chunk_set,
        })
    }

    /// Open an existing tensor.
    pub fn open(
        key: &str,
        commit_id: CommitId,
        cache: Arc<ObjectCache>,
        pipeline: Pipeline,
        resolver: R,
    ) -> EngineResult<Self> {
        let meta: Shared<TensorMeta> = cache
            .get_object(&keys::tensor_meta_key(key, commit_id.as_str()))?
            .ok_or_else(|| EngineError::TensorNotFound(key.to_string()))?;
        resolver.accepts(&meta.read().expect("lock poisoned"))?;

        let ids_key = keys::chunk_id_encoder_key(key, commit_id.as_str());
        let chunk_ids: Shared<ChunkIdEncoder> = match cache.get_object(&ids_key)? {
            Some(ids) => ids,
            None if meta.read().expect("lock poisoned").length == 0 => {
                Arc::new(RwLock::new(ChunkIdEncoder::new()))
            }
            None => {
                return Err(EngineError::Corrupt {
                    key: ids_key,
                    reason: "chunk id encoder missing for a non-empty tensor".into(),
                })
            }
        };
        let chunk_set: Shared<ChunkSet> = cache
            .get_object(&keys::chunk_set_key(key, commit_id.as_str()))?
            .unwrap_or_default();
        debug!(tensor = key, commit = %commit_id, "tensor opened");

        Ok(Self {
            key: key.to_string(),
            commit_id,
            cache,
            pipeline,
            resolver,
            meta,
            chunk_ids,
            chunk_set,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn commit_id(&self) -> &CommitId {
        &self.commit_id
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Snapshot of the tensor metadata.
    pub fn meta(&self) -> TensorMeta {
        self.meta.read().expect("lock poisoned").clone()
    }

    pub fn len(&self) -> u64 {
        self.meta.read().expect("lock poisoned").length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Option<DType> {
        self.meta.read().expect("lock poisoned").dtype
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_ids.read().expect("lock poisoned").num_chunks()
    }

    pub fn num_compressed_bytes(&self) -> u64 {
        self.meta.read().expect("lock poisoned").num_compressed_bytes
    }

    pub fn num_uncompressed_bytes(&self) -> u64 {
        self.meta.read().expect("lock poisoned").num_uncompressed_bytes
    }

    /// Elementwise `(min, max)` over every stored sample shape.
    pub fn shape_interval(&self) -> (Vec<usize>, Vec<usize>) {
        let meta = self.meta.read().expect("lock poisoned");
        (meta.min_shape.clone(), meta.max_shape.clone())
    }

    pub(crate) fn context<'a>(&'a self, meta: &'a TensorMeta) -> EngineContext<'a> {
        EngineContext {
            key: &self.key,
            commit_id: &self.commit_id,
            cache: &self.cache,
            pipeline: &self.pipeline,
            meta,
        }
    }

    fn meta_key(&self) -> String {
        keys::tensor_meta_key(&self.key, self.commit_id.as_str())
    }

    fn chunk_ids_key(&self) -> String {
        keys::chunk_id_encoder_key(&self.key, self.commit_id.as_str())
    }

    fn chunk_set_key(&self) -> String {
        keys::chunk_set_key(&self.key, self.commit_id.as_str())
    }

    fn chunk_key(&self, id: ChunkId) -> String {
        keys::chunk_key(&self.key, &ChunkIdEncoder::name_of(id))
    }

    /// Mark `obj` dirty, registering it first if the cache has never seen it.
    fn touch<T: CacheObject>(&self, key: &str, obj: &Shared<T>) -> EngineResult<()> {
        match self.cache.mark_dirty(key) {
            Err(StoreError::NotFound(_)) => Ok(self.cache.register_object(key, obj)?),
            other => Ok(other?),
        }
    }

    fn load_chunk(&self, id: ChunkId) -> EngineResult<Shared<Chunk>> {
        let key = self.chunk_key(id);
        self.cache
            .get_object(&key)?
            .ok_or_else(|| EngineError::Corrupt {
                key,
                reason: "chunk referenced by the chunk id encoder is missing".into(),
            })
    }

    pub(crate) fn check_index(&self, index: u64, len: u64) -> EngineResult<()> {
        if index >= len {
            return Err(EngineError::IndexOutOfRange { index, len });
        }
        Ok(())
    }

    /// Append samples in order. All samples are checked and encoded before
    /// anything is mutated, so a failing batch leaves the tensor untouched.
    pub fn extend(&mut self, samples: Vec<Sample>) -> EngineResult<u64> {
        self.cache.check_writable()?;
        if samples.is_empty() {
            return Ok(0);
        }

        let snapshot = self.meta();
        let checked = {
            let ctx = self.context(&snapshot);
            self.resolver.check_samples(&ctx, samples)?
        };

        let mut planned = snapshot.clone();
        let mut encoded = Vec::with_capacity(checked.len());
        {
            let ctx = self.context(&snapshot);
            for sample in &checked {
                let enc = self.resolver.encode(&ctx, sample, planned.dtype)?;
                if planned.dtype.is_none() {
                    planned.dtype = enc.dtype;
                }
                if enc.track_shape {
                    planned.update_shape_interval(&enc.shape)?;
                }
                encoded.push(enc);
            }
        }

        let meta_handle = Arc::clone(&self.meta);
        let updated = {
            let mut meta = meta_handle.write().expect("lock poisoned");
            if meta.dtype.is_none() {
                meta.dtype = planned.dtype;
            }
            for enc in &encoded {
                let (chunk_id, delta) = self.place(&meta, enc)?;
                self.chunk_ids
                    .write()
                    .expect("lock poisoned")
                    .register_samples(chunk_id, 1);
                meta.length += 1;
                meta.num_compressed_bytes = apply_delta(meta.num_compressed_bytes, delta);
                meta.num_uncompressed_bytes += enc.raw_nbytes;
                if enc.track_shape {
                    meta.update_shape_interval(&enc.shape)?;
                }
            }
            meta.clone()
        };
        self.touch(&self.meta_key(), &self.meta)?;
        self.touch(&self.chunk_ids_key(), &self.chunk_ids)?;

        let ctx = self.context(&updated);
        self.resolver.after_extend(&ctx, &checked)?;
        debug!(
            tensor = %self.key,
            added = encoded.len(),
            len = updated.length,
            "samples appended"
        );
        Ok(encoded.len() as u64)
    }

    pub fn append(&mut self, sample: Sample) -> EngineResult<()> {
        self.extend(vec![sample]).map(|_| ())
    }

    /// Put one sample into the open chunk, or a new one if it does not fit.
    fn place(&self, meta: &TensorMeta, enc: &EncodedSample) -> EngineResult<(ChunkId, i64)> {
        let compression = meta.storage_compression();
        let max = Some(meta.max_chunk_size);
        let last = self.chunk_ids.read().expect("lock poisoned").last_chunk_id();
        if let Some(last) = last {
            if self.owns(last) {
                let chunk = self.load_chunk(last)?;
                let appended = chunk
                    .write()
                    .expect("lock poisoned")
                    .try_append(enc, &self.pipeline, compression, max)?;
                if let Some(delta) = appended {
                    self.touch(&self.chunk_key(last), &chunk)?;
                    return Ok((last, delta));
                }
            } else {
                // Inherited chunks are only copied once the sample lands in them.
                let mut copy = self.load_chunk(last)?.read().expect("lock poisoned").duplicate();
                if let Some(delta) = copy.try_append(enc, &self.pipeline, compression, max)? {
                    return Ok((self.adopt_tail(last, copy)?, delta));
                }
            }
        }

        let id = ChunkIdEncoder::generate_id();
        let mut chunk = Chunk::new(meta.storage_mode());
        let delta = chunk
            .try_append(enc, &self.pipeline, compression, None)?
            .unwrap_or_default();
        self.cache.put_object(&self.chunk_key(id), chunk)?;
        self.chunk_set
            .write()
            .expect("lock poisoned")
            .ids
            .insert(id);
        self.touch(&self.chunk_set_key(), &self.chunk_set)?;
        debug!(tensor = %self.key, chunk = %ChunkIdEncoder::name_of(id), "chunk opened");
        Ok((id, delta))
    }

    /// Whether chunk `id` was created by this commit and may be mutated.
    fn owns(&self, id: ChunkId) -> bool {
        self.chunk_set.read().expect("lock poisoned").ids.contains(&id)
    }

    /// Store `copy` of the inherited open chunk `inherited` under a fresh id
    /// owned by this commit.
    fn adopt_tail(&self, inherited: ChunkId, copy: Chunk) -> EngineResult<ChunkId> {
        let id = ChunkIdEncoder::generate_id();
        self.cache.put_object(&self.chunk_key(id), copy)?;
        self.chunk_ids
            .write()
            .expect("lock poisoned")
            .replace_last_chunk_id(id)?;
        self.chunk_set
            .write()
            .expect("lock poisoned")
            .ids
            .insert(id);
        self.touch(&self.chunk_ids_key(), &self.chunk_ids)?;
        self.touch(&self.chunk_set_key(), &self.chunk_set)?;
        debug!(
            tensor = %self.key,
            from = %ChunkIdEncoder::name_of(inherited),
            to = %ChunkIdEncoder::name_of(id),
            "copied inherited chunk"
        );
        Ok(id)
    }

    /// Id of the open chunk, copying it into this commit first if it was
    /// created by an ancestor.
    fn writable_tail(&self) -> EngineResult<Option<ChunkId>> {
        let Some(last) = self.chunk_ids.read().expect("lock poisoned").last_chunk_id() else {
            return Ok(None);
        };
        if self.owns(last) {
            return Ok(Some(last));
        }
        let copy = self.load_chunk(last)?.read().expect("lock poisoned").duplicate();
        self.adopt_tail(last, copy).map(Some)
    }

    pub(crate) fn stored_sample(&self, meta: &TensorMeta, global: u64) -> EngineResult<StoredSample> {
        let (id, local) = self
            .chunk_ids
            .read()
            .expect("lock poisoned")
            .translate_index_relative_to_chunks(global)?;
        let chunk = self.load_chunk(id)?;
        let compression = meta.storage_compression();
        if meta.storage_mode() == CompressionMode::PerChunk && self.resolver.is_data_cachable() {
            let mut c = chunk.write().expect("lock poisoned");
            if !c.has_raw() {
                c.load_raw(&self.pipeline, compression)?;
            }
        }
        let c = chunk.read().expect("lock poisoned");
        Ok(StoredSample {
            bytes: c.sample_bytes(local, &self.pipeline, compression)?,
            shape: c.shape(local)?.to_vec(),
        })
    }

    /// Read sample `global_index`, applying `sub_index` to its axes.
    pub fn read_sample(
        &self,
        global_index: u64,
        sub_index: &[IndexEntry],
        opts: ReadOptions,
    ) -> EngineResult<NdArray> {
        let meta = self.meta.read().expect("lock poisoned");
        self.check_index(global_index, meta.length)?;
        let stored = self.stored_sample(&meta, global_index)?;
        let ctx = self.context(&meta);
        self.resolver
            .materialize(&ctx, global_index, stored, sub_index, opts)
    }

    /// Read every sample selected by the first entry of `index`.
    pub fn read(&self, index: &Index, opts: ReadOptions) -> EngineResult<Vec<NdArray>> {
        let len = self.len();
        let positions = match index.sample_entry() {
            Some(entry) => entry.positions(0, len as usize)?,
            None => (0..len as usize).collect(),
        };
        positions
            .into_iter()
            .map(|i| self.read_sample(i as u64, index.sub_index(), opts))
            .collect()
    }

    pub fn read_shape(&self, global_index: u64) -> EngineResult<Vec<usize>> {
        let meta = self.meta.read().expect("lock poisoned");
        self.check_index(global_index, meta.length)?;
        let (id, local) = self
            .chunk_ids
            .read()
            .expect("lock poisoned")
            .translate_index_relative_to_chunks(global_index)?;
        let chunk = self.load_chunk(id)?;
        let recorded = chunk.read().expect("lock poisoned").shape(local)?.to_vec();
        let load = || -> EngineResult<Vec<u8>> { Ok(self.stored_sample(&meta, global_index)?.bytes) };
        let ctx = self.context(&meta);
        self.resolver
            .read_shape(&ctx, global_index, &recorded, &load)
    }

    /// Raw byte contribution of sample `local` in `chunk`.
    fn raw_nbytes(meta: &TensorMeta, chunk: &Chunk, local: u64) -> EngineResult<u64> {
        if chunk.mode() == CompressionMode::PerSample {
            let itemsize = meta.dtype.map(|d| d.itemsize()).unwrap_or(1);
            let numel: usize = chunk.shape(local)?.iter().product();
            Ok((numel * itemsize) as u64)
        } else {
            let (start, end) = chunk.positions().range(local)?;
            Ok(end - start)
        }
    }

    /// Sum of stored chunk sizes, recomputed from the chunks themselves.
    pub fn recompute_num_compressed_bytes(&self) -> EngineResult<u64> {
        let ids: Vec<ChunkId> = self
            .chunk_ids
            .read()
            .expect("lock poisoned")
            .chunks()
            .map(|(id, _)| id)
            .collect();
        let mut total = 0;
        for id in ids {
            total += self.load_chunk(id)?.read().expect("lock poisoned").nbytes();
        }
        Ok(total)
    }

    /// Sum of raw sample sizes, recomputed from the chunk indexes.
    pub fn recompute_num_uncompressed_bytes(&self) -> EngineResult<u64> {
        let meta = self.meta();
        let ids: Vec<ChunkId> = self
            .chunk_ids
            .read()
            .expect("lock poisoned")
            .chunks()
            .map(|(id, _)| id)
            .collect();
        let itemsize = meta.dtype.map(|d| d.itemsize()).unwrap_or(1) as u64;
        let mut total = 0;
        for id in ids {
            let chunk = self.load_chunk(id)?;
            let chunk = chunk.read().expect("lock poisoned");
            total += if chunk.mode() == CompressionMode::PerSample {
                chunk
                    .shapes()
                    .runs()
                    .map(|(shape, count)| shape.iter().product::<usize>() as u64 * count * itemsize)
                    .sum::<u64>()
            } else {
                chunk.positions().num_bytes()
            };
        }
        Ok(total)
    }

    /// Remove the last `count` samples. Only samples in the open chunk can
    /// be popped.
    pub fn pop_last(&mut self, count: u64) -> EngineResult<()> {
        self.cache.check_writable()?;
        if count == 0 {
            return Ok(());
        }
        let length = self.len();
        if count > length {
            return Err(EngineError::CannotPop(format!(
                "tensor holds {length} samples, {count} requested"
            )));
        }
        let in_tail = self.chunk_ids.read().expect("lock poisoned").samples_in_last_chunk();
        if count > in_tail {
            return Err(EngineError::CannotPop(format!(
                "only the {in_tail} samples of the open chunk can be popped"
            )));
        }
        let id = self
            .writable_tail()?
            .ok_or_else(|| EngineError::CannotPop("tensor has no chunks".into()))?;
        let chunk = self.load_chunk(id)?;

        let meta_handle = Arc::clone(&self.meta);
        let updated = {
            let mut meta = meta_handle.write().expect("lock poisoned");
            let compression = meta.storage_compression();
            let (delta, removed_raw, emptied) = {
                let mut c = chunk.write().expect("lock poisoned");
                let n = c.num_samples();
                let mut removed_raw = 0;
                for local in n - count..n {
                    removed_raw += Self::raw_nbytes(&meta, &c, local)?;
                }
                let delta = c.pop(count, &self.pipeline, compression)?;
                (delta, removed_raw, c.is_empty())
            };
            self.chunk_ids.write().expect("lock poisoned").pop(count)?;

            if emptied {
                self.cache.delete(&self.chunk_key(id))?;
                self.chunk_set
                    .write()
                    .expect("lock poisoned")
                    .ids
                    .remove(&id);
                self.touch(&self.chunk_set_key(), &self.chunk_set)?;
            } else {
                self.touch(&self.chunk_key(id), &chunk)?;
            }
            meta.length -= count;
            meta.num_compressed_bytes = apply_delta(meta.num_compressed_bytes, delta);
            meta.num_uncompressed_bytes = meta.num_uncompressed_bytes.saturating_sub(removed_raw);
            meta.clone()
        };
        self.touch(&self.meta_key(), &self.meta)?;
        self.touch(&self.chunk_ids_key(), &self.chunk_ids)?;

        let ctx = self.context(&updated);
        self.resolver.after_pop(&ctx, count)?;
        debug!(tensor = %self.key, popped = count, len = updated.length, "samples popped");
        Ok(())
    }

    /// Write every dirty object back to storage.
    pub fn flush(&self) -> EngineResult<usize> {
        Ok(self.cache.flush()?)
    }
}

impl<R: SampleResolver + Clone> ChunkEngine<R> {
    /// The same tensor at a new child commit. Chunks are shared until the
    /// child mutates them.
    pub fn fork(&self, new_commit: CommitId) -> EngineResult<Self> {
        self.cache.check_writable()?;
        let meta = self.meta();
        let ctx = self.context(&meta);
        self.resolver.fork(&ctx, &new_commit)?;

        let commit = new_commit.as_str();
        let chunk_ids = self.chunk_ids.read().expect("lock poisoned").clone();
        let engine = Self {
            key: self.key.clone(),
            meta: self
                .cache
                .put_object(&keys::tensor_meta_key(&self.key, commit), meta)?,
            chunk_ids: self
                .cache
                .put_object(&keys::chunk_id_encoder_key(&self.key, commit), chunk_ids)?,
            chunk_set: self
                .cache
                .put_object(&keys::chunk_set_key(&self.key, commit), ChunkSet::default())?,
            commit_id: new_commit,
            cache: Arc::clone(&self.cache),
            pipeline: self.pipeline.clone(),
            resolver: self.resolver.clone(),
        };
        info!(tensor = %self.key, from = %self.commit_id, to = %engine.commit_id, "tensor forked");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tc_store::{LocalProvider, MemoryProvider, StorageProvider};
    use tc_types::CompressedSample;

    fn cache() -> Arc<ObjectCache> {
        Arc::new(ObjectCache::new(Arc::new(MemoryProvider::new())))
    }

    fn engine(cache: Arc<ObjectCache>, config: TensorConfig) -> InlineChunkEngine {
        ChunkEngine::create(
            "t",
            CommitId::first(),
            cache,
            Pipeline::new(),
            InlineResolver,
            &config,
            &EngineConfig::default(),
        )
        .unwrap()
    }

    /// A `(h, w, c)` u8 image with a deterministic gradient.
    fn image(h: usize, w: usize, c: usize) -> NdArray {
        let values: Vec<u8> = (0..h * w * c).map(|i| (i % 251) as u8).collect();
        NdArray::from_vec(vec![h, w, c], values).unwrap()
    }

    /// Pixels no image codec can shrink.
    fn noise(h: usize, w: usize, c: usize, seed: u32) -> NdArray {
        let mut state = seed.wrapping_add(1);
        let values: Vec<u8> = (0..h * w * c)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();
        NdArray::from_vec(vec![h, w, c], values).unwrap()
    }

    /// A `(h, w, 3)` diagonal ramp that survives lossy compression.
    fn smooth(h: usize, w: usize) -> NdArray {
        let values: Vec<u8> = (0..h * w * 3)
            .map(|i| {
                let (y, x) = (i / 3 / w, i / 3 % w);
                ((y + x) * 3) as u8
            })
            .collect();
        NdArray::from_vec(vec![h, w, 3], values).unwrap()
    }

    fn mean_error(a: &NdArray, b: &NdArray) -> u64 {
        let total: u64 = a
            .as_bytes()
            .iter()
            .zip(b.as_bytes())
            .map(|(x, y)| x.abs_diff(*y) as u64)
            .sum();
        total / a.nbytes().max(1) as u64
    }

    fn reopen(provider: Arc<dyn StorageProvider>) -> InlineChunkEngine {
        InlineChunkEngine::open(
            "t",
            CommitId::first(),
            Arc::new(ObjectCache::read_only(provider)),
            Pipeline::new(),
            InlineResolver,
        )
        .unwrap()
    }

    fn png_file(array: &NdArray) -> Sample {
        let bytes = Pipeline::new()
            .encode_sample(array, Some(tc_codec::Compression::Png))
            .unwrap();
        Sample::Compressed(CompressedSample::new("png", bytes))
    }

    #[test]
    fn png_mixed_inputs_keep_order_and_shapes() {
        let mut e = engine(
            cache(),
            TensorConfig::new().htype("image").sample_compression("png"),
        );
        let cat = image(90, 90, 3);
        let flower = image(51, 46, 4);
        let nested = serde_json::json!(vec![vec![vec![1; 4]; 100]; 100]);
        let ones = NdArray::from_json(&nested, None).unwrap();
        assert_eq!(ones.dtype(), DType::I64);

        e.extend(vec![
            png_file(&cat),
            png_file(&flower),
            Sample::RawArray(ones.clone()),
        ])
        .unwrap();
        e.extend(vec![
            Sample::RawArray(ones.clone()),
            png_file(&flower),
            png_file(&cat),
        ])
        .unwrap();

        assert_eq!(e.len(), 6);
        let expected = [&cat, &flower, &ones, &ones, &flower, &cat];
        for (i, want) in expected.iter().enumerate() {
            let got = e.read_sample(i as u64, &[], ReadOptions::default()).unwrap();
            assert_eq!(got.shape(), want.shape(), "sample {i}");
            assert_eq!(got.dtype(), DType::U8);
        }
        let got = e.read_sample(0, &[], ReadOptions::default()).unwrap();
        assert_eq!(got, cat);
        let got = e.read_sample(2, &[], ReadOptions::default()).unwrap();
        assert_eq!(got, NdArray::filled(vec![100, 100, 4], 1u8));
        assert_eq!(e.shape_interval(), (vec![51, 46, 3], vec![100, 100, 4]));
    }

    #[test]
    fn verbatim_png_counts_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalProvider::open(dir.path()).unwrap());
        let flower = image(51, 46, 4);
        let Sample::Compressed(file) = png_file(&flower) else {
            unreachable!()
        };
        let file_size = file.bytes.len() as u64;
        {
            let mut e = engine(
                Arc::new(ObjectCache::new(provider.clone())),
                TensorConfig::new().htype("image").sample_compression("png"),
            );
            e.append(Sample::Compressed(file)).unwrap();
            assert_eq!(e.num_compressed_bytes(), file_size);
            assert_eq!(e.num_uncompressed_bytes(), 51 * 46 * 4);
            e.flush().unwrap();
        }
        let reopened = InlineChunkEngine::open(
            "t",
            CommitId::first(),
            Arc::new(ObjectCache::read_only(provider)),
            Pipeline::new(),
            InlineResolver,
        )
        .unwrap();
        assert_eq!(reopened.num_compressed_bytes(), file_size);
        assert_eq!(reopened.num_uncompressed_bytes(), 51 * 46 * 4);
    }

    #[test]
    fn jpeg_rejects_alpha_channel() {
        let mut e = engine(
            cache(),
            TensorConfig::new().htype("image").sample_compression("jpg"),
        );
        let err = e.append(Sample::RawArray(image(8, 8, 4))).unwrap_err();
        assert!(matches!(err, EngineError::SampleCompression(_)));
        assert_eq!(e.len(), 0);
        e.append(Sample::RawArray(image(8, 8, 3))).unwrap();
        assert_eq!(e.read_shape(0).unwrap(), vec![8, 8, 3]);
    }

    #[test]
    fn failing_batch_leaves_tensor_untouched() {
        let mut e = engine(cache(), TensorConfig::new());
        e.append(NdArray::filled(vec![2], 1u8).into()).unwrap();
        let err = e
            .extend(vec![
                NdArray::filled(vec![2], 2u8).into(),
                NdArray::filled(vec![2, 2], 3u8).into(),
            ])
            .unwrap_err();
        assert!(matches!(err, EngineError::ShapeDimMismatch { .. }));
        assert_eq!(e.len(), 1);
        assert_eq!(e.num_uncompressed_bytes(), 2);
    }

    #[test]
    fn unsafe_cast_rejected() {
        let mut e = engine(cache(), TensorConfig::new().dtype("uint8"));
        let err = e.append(NdArray::filled(vec![2], 300i32).into()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DTypeMismatch {
                expected: DType::U8,
                actual: DType::I32
            }
        ));
        e.append(NdArray::filled(vec![2], 7i32).into()).unwrap();
        let got = e.read_sample(0, &[], ReadOptions::default()).unwrap();
        assert_eq!(got.to_vec::<u8>().unwrap(), vec![7, 7]);
    }

    #[test]
    fn chunks_roll_over_at_max_size() {
        let provider = Arc::new(MemoryProvider::new());
        let mut e = engine(
            Arc::new(ObjectCache::new(provider.clone())),
            TensorConfig::new()
                .chunk_compression("lz4")
                .max_chunk_size(64),
        );
        for i in 0..20u8 {
            let noise: Vec<u8> = (0..40).map(|j| (j * 37 + i as usize * 11) as u8).collect();
            e.append(NdArray::from_vec(vec![40], noise).unwrap().into())
                .unwrap();
        }
        assert!(e.num_chunks() > 1);
        assert_eq!(e.num_compressed_bytes(), e.recompute_num_compressed_bytes().unwrap());
        assert_eq!(e.num_uncompressed_bytes(), 800);
        assert_eq!(e.recompute_num_uncompressed_bytes().unwrap(), 800);
        let got = e.read_sample(13, &[], ReadOptions::default()).unwrap();
        let want: Vec<u8> = (0..40).map(|j| (j * 37 + 13 * 11) as u8).collect();
        assert_eq!(got.to_vec::<u8>().unwrap(), want);

        e.flush().unwrap();
        let reopened = reopen(provider);
        assert_eq!(reopened.num_chunks(), e.num_chunks());
        assert_eq!(reopened.num_compressed_bytes(), e.num_compressed_bytes());
        for i in [0u8, 13, 19] {
            let got = reopened.read_sample(i as u64, &[], ReadOptions::default()).unwrap();
            let want: Vec<u8> = (0..40).map(|j| (j * 37 + i as usize * 11) as u8).collect();
            assert_eq!(got.to_vec::<u8>().unwrap(), want, "sample {i}");
        }
    }

    #[test]
    fn png_chunks_roll_over_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalProvider::open(dir.path()).unwrap());
        let samples: Vec<NdArray> = (0..6).map(|i| noise(16, 16 + i, 4, i as u32)).collect();
        let raw_total: u64 = samples.iter().map(|a| a.nbytes() as u64).sum();
        let (chunks, compressed) = {
            let mut e = engine(
                Arc::new(ObjectCache::new(provider.clone())),
                TensorConfig::new()
                    .htype("image")
                    .chunk_compression("png")
                    .max_chunk_size(2500),
            );
            e.extend(samples.iter().cloned().map(Sample::RawArray).collect())
                .unwrap();
            assert!(e.num_chunks() > 1);
            assert_eq!(e.num_uncompressed_bytes(), raw_total);
            assert_eq!(e.num_compressed_bytes(), e.recompute_num_compressed_bytes().unwrap());
            e.flush().unwrap();
            (e.num_chunks(), e.num_compressed_bytes())
        };

        let reopened = reopen(provider);
        assert_eq!(reopened.num_chunks(), chunks);
        assert_eq!(reopened.num_compressed_bytes(), compressed);
        assert_eq!(reopened.recompute_num_compressed_bytes().unwrap(), compressed);
        assert_eq!(reopened.recompute_num_uncompressed_bytes().unwrap(), raw_total);
        for (i, want) in samples.iter().enumerate() {
            let got = reopened.read_sample(i as u64, &[], ReadOptions::default()).unwrap();
            assert_eq!(&got, want, "sample {i}");
        }
    }

    #[test]
    fn png_chunk_splits_on_channel_change() {
        let mut e = engine(
            cache(),
            TensorConfig::new().htype("image").chunk_compression("png"),
        );
        let rgba = image(8, 8, 4);
        let rgb = image(6, 5, 3);
        e.extend(vec![rgba.clone().into(), rgba.clone().into(), rgb.clone().into()])
            .unwrap();
        assert_eq!(e.num_chunks(), 2);
        assert_eq!(e.read_sample(1, &[], ReadOptions::default()).unwrap(), rgba);
        assert_eq!(e.read_sample(2, &[], ReadOptions::default()).unwrap(), rgb);
    }

    #[test]
    fn jpeg_chunks_mix_files_and_arrays() {
        let provider = Arc::new(MemoryProvider::new());
        let cat = smooth(24, 20);
        let array = smooth(10, 30);
        let cat_file = Sample::Compressed(CompressedSample::new(
            "jpg",
            Pipeline::new()
                .encode_sample(&cat, Some(tc_codec::Compression::Jpeg))
                .unwrap(),
        ));
        {
            let mut e = engine(
                Arc::new(ObjectCache::new(provider.clone())),
                TensorConfig::new().htype("image").chunk_compression("jpg"),
            );
            e.extend(vec![cat_file.clone(), array.clone().into(), cat_file])
                .unwrap();
            assert!(matches!(
                e.append(image(4, 4, 4).into()),
                Err(EngineError::SampleCompression(_))
            ));
            e.flush().unwrap();
        }

        let reopened = reopen(provider);
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.num_chunks(), 1);
        for (i, want) in [&cat, &array, &cat].iter().enumerate() {
            let got = reopened.read_sample(i as u64, &[], ReadOptions::default()).unwrap();
            assert_eq!(got.shape(), want.shape(), "sample {i}");
            assert!(mean_error(&got, want) < 8, "sample {i}");
        }
    }

    #[test]
    fn jpeg_accepts_one_dimensional_rows() {
        let mut e = engine(cache(), TensorConfig::new().sample_compression("jpg"));
        e.append(NdArray::filled(vec![100], 120u8).into()).unwrap();
        assert_eq!(e.read_shape(0).unwrap(), vec![100]);
        let got = e.read_sample(0, &[], ReadOptions::default()).unwrap();
        assert_eq!(got.shape(), &[100]);
        assert!(mean_error(&got, &NdArray::filled(vec![100], 120u8)) < 4);
    }

    #[test]
    fn counters_survive_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalProvider::open(dir.path()).unwrap());
        let (compressed, uncompressed) = {
            let mut e = engine(
                Arc::new(ObjectCache::new(provider.clone())),
                TensorConfig::new().htype("image").sample_compression("png"),
            );
            e.extend(vec![image(10, 10, 3).into(), image(4, 6, 1).into()])
                .unwrap();
            e.flush().unwrap();
            (e.num_compressed_bytes(), e.num_uncompressed_bytes())
        };
        assert_eq!(uncompressed, 300 + 24);

        let reopened = InlineChunkEngine::open(
            "t",
            CommitId::first(),
            Arc::new(ObjectCache::read_only(provider)),
            Pipeline::new(),
            InlineResolver,
        )
        .unwrap();
        assert_eq!(reopened.num_compressed_bytes(), compressed);
        assert_eq!(reopened.num_uncompressed_bytes(), uncompressed);
        assert_eq!(reopened.recompute_num_compressed_bytes().unwrap(), compressed);
        assert_eq!(reopened.recompute_num_uncompressed_bytes().unwrap(), uncompressed);
        assert_eq!(reopened.read_shape(1).unwrap(), vec![4, 6, 1]);
    }

    #[test]
    fn pop_restores_counters() {
        let mut e = engine(cache(), TensorConfig::new().chunk_compression("zstd"));
        e.append(NdArray::filled(vec![100], 1u16).into()).unwrap();
        let (c, u) = (e.num_compressed_bytes(), e.num_uncompressed_bytes());
        e.extend(vec![
            NdArray::filled(vec![50], 2u16).into(),
            NdArray::filled(vec![10], 3u16).into(),
        ])
        .unwrap();
        e.pop_last(2).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e.num_compressed_bytes(), c);
        assert_eq!(e.num_uncompressed_bytes(), u);
        e.pop_last(1).unwrap();
        assert_eq!(e.num_chunks(), 0);
        assert_eq!(e.num_compressed_bytes(), 0);
        assert!(matches!(e.pop_last(1), Err(EngineError::CannotPop(_))));
    }

    #[test]
    fn pop_is_not_durable_until_flush() {
        let provider = Arc::new(MemoryProvider::new());
        let mut e = engine(Arc::new(ObjectCache::new(provider.clone())), TensorConfig::new());
        e.append(NdArray::filled(vec![4], 9u8).into()).unwrap();
        e.flush().unwrap();
        let stored = provider.keys("t/chunks/").unwrap().len();
        assert_eq!(stored, 1);

        e.pop_last(1).unwrap();
        assert_eq!(e.num_chunks(), 0);
        assert_eq!(provider.keys("t/chunks/").unwrap().len(), stored);
        let before_flush = reopen(provider.clone());
        assert_eq!(before_flush.len(), 1);
        let got = before_flush.read_sample(0, &[], ReadOptions::default()).unwrap();
        assert_eq!(got.to_vec::<u8>().unwrap(), vec![9; 4]);

        e.flush().unwrap();
        assert!(provider.keys("t/chunks/").unwrap().is_empty());
        let after_flush = reopen(provider);
        assert_eq!(after_flush.len(), 0);
        assert_eq!(after_flush.num_chunks(), 0);
    }

    #[test]
    fn fork_leaves_full_inherited_chunk_alone() {
        let cache = cache();
        let mut parent = engine(cache.clone(), TensorConfig::new().max_chunk_size(64));
        parent.append(NdArray::filled(vec![60], 1u8).into()).unwrap();
        let inherited = parent.chunk_ids.read().unwrap().last_chunk_id().unwrap();

        let mut child = parent.fork(CommitId::from("child")).unwrap();
        child.append(NdArray::filled(vec![60], 2u8).into()).unwrap();
        assert_eq!(child.num_chunks(), 2);
        let ids: Vec<ChunkId> = child
            .chunk_ids
            .read()
            .unwrap()
            .chunks()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids[0], inherited);
        let owned = child.chunk_set.read().unwrap().ids.clone();
        assert_eq!(owned.len(), 1);
        assert!(!owned.contains(&inherited));
        assert_eq!(child.num_compressed_bytes(), child.recompute_num_compressed_bytes().unwrap());
    }

    #[test]
    fn fork_copies_inherited_chunk_on_write() {
        let cache = cache();
        let mut parent = engine(cache.clone(), TensorConfig::new());
        parent.append(NdArray::filled(vec![3], 1u8).into()).unwrap();
        let mut child = parent.fork(CommitId::from("child")).unwrap();
        child.append(NdArray::filled(vec![3], 2u8).into()).unwrap();

        assert_eq!(parent.len(), 1);
        assert_eq!(child.len(), 2);
        let first = parent.read_sample(0, &[], ReadOptions::default()).unwrap();
        assert_eq!(first.to_vec::<u8>().unwrap(), vec![1, 1, 1]);
        let parent_chunk = parent.chunk_ids.read().unwrap().last_chunk_id();
        let child_chunk = child.chunk_ids.read().unwrap().last_chunk_id();
        assert_ne!(parent_chunk, child_chunk);
        assert_eq!(
            parent.recompute_num_compressed_bytes().unwrap(),
            parent.num_compressed_bytes()
        );
    }

    #[test]
    fn sub_index_and_raw_reads() {
        let mut e = engine(
            cache(),
            TensorConfig::new().htype("image").sample_compression("png"),
        );
        e.append(image(4, 5, 3).into()).unwrap();
        let row = e
            .read_sample(0, &[IndexEntry::Int(1)], ReadOptions::default())
            .unwrap();
        assert_eq!(row.shape(), &[5, 3]);

        let raw = e
            .read_sample(
                0,
                &[],
                ReadOptions {
                    decompress: false,
                    ..ReadOptions::default()
                },
            )
            .unwrap();
        assert_eq!(raw.ndim(), 1);
        assert_eq!(&raw.as_bytes()[1..4], b"PNG");
    }

    #[test]
    fn read_only_cache_rejects_writes() {
        let provider = Arc::new(MemoryProvider::new());
        let cache = Arc::new(ObjectCache::new(provider.clone()));
        engine(cache.clone(), TensorConfig::new()).flush().unwrap();
        let mut e = InlineChunkEngine::open(
            "t",
            CommitId::first(),
            Arc::new(ObjectCache::read_only(provider)),
            Pipeline::new(),
            InlineResolver,
        )
        .unwrap();
        assert!(e.append(Sample::Empty).unwrap_err().is_read_only());
    }

    #[test]
    fn duplicate_and_missing_tensors() {
        let cache = cache();
        engine(cache.clone(), TensorConfig::new());
        let again = InlineChunkEngine::create(
            "t",
            CommitId::first(),
            cache.clone(),
            Pipeline::new(),
            InlineResolver,
            &TensorConfig::new(),
            &EngineConfig::default(),
        );
        assert!(matches!(again, Err(EngineError::TensorExists(_))));
        let missing = InlineChunkEngine::open("u", CommitId::first(), cache, Pipeline::new(), InlineResolver);
        assert!(matches!(missing, Err(EngineError::TensorNotFound(_))));
    }

    #[test]
    fn linked_samples_rejected_inline() {
        let mut e = engine(cache(), TensorConfig::new());
        let err = e.append(Sample::link("a.png", None)).unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedSampleType { .. }));
    }
}
