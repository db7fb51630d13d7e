//! Linked tensors: chunks hold only paths; credentials are tracked per
//! sample in a [`CredsEncoder`] and resolved through [`LinkCreds`].

use std::sync::{Arc, RwLock};

use tc_codec::{Compression, CompressionKind, MediaSource};
use tc_index::CredsEncoder;
use tc_store::{keys, Shared, StoreError};
use tc_types::{CommitId, DType, Index, IndexEntry, LinkedSample, NdArray, Sample};
use tracing::{debug, warn};

use crate::engine::ChunkEngine;
use crate::error::{EngineError, EngineResult};
use crate::link_creds::{LinkCreds, ProviderKind};
use crate::meta::TensorMeta;
use crate::resolver::{EncodedSample, EngineContext, ReadOptions, SampleResolver, StoredSample};
use crate::video::normalize_index;

/// Engine over linked samples.
pub type LinkedChunkEngine = ChunkEngine<LinkedResolver>;

/// A linked sample that passed the append-time checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedLink {
    /// `None` for an empty sample.
    pub link: Option<LinkedSample>,
    /// Shape of the resource, when it was inspected.
    pub shape: Option<Vec<usize>>,
    pub dtype: Option<DType>,
}

impl VerifiedLink {
    pub fn path(&self) -> &str {
        self.link.as_ref().map_or("", |l| l.path.as_str())
    }

    pub fn creds_key(&self) -> Option<&str> {
        self.link.as_ref().and_then(|l| l.creds_key.as_deref())
    }
}

/// Resolver for linked samples.
#[derive(Clone, Debug)]
pub struct LinkedResolver {
    creds: Arc<LinkCreds>,
    presigned_url_full: bool,
}

fn path_of(bytes: Vec<u8>) -> EngineResult<String> {
    String::from_utf8(bytes).map_err(|e| EngineError::Corrupt {
        key: "linked path".into(),
        reason: e.to_string(),
    })
}

fn compression_of(path: &str) -> EngineResult<Compression> {
    Compression::from_path(path).map_err(|e| EngineError::LinkVerification {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

impl LinkedResolver {
    pub fn new(creds: Arc<LinkCreds>) -> Self {
        Self {
            creds,
            presigned_url_full: true,
        }
    }

    pub fn with_presigned_url_full(mut self, full: bool) -> Self {
        self.presigned_url_full = full;
        self
    }

    pub fn link_creds(&self) -> &Arc<LinkCreds> {
        &self.creds
    }

    /// The commit's creds encoder, created empty on first access. A
    /// read-only cache leaves the new encoder unregistered.
    pub(crate) fn creds_encoder(&self, ctx: &EngineContext<'_>) -> EngineResult<Shared<CredsEncoder>> {
        let key = keys::creds_encoder_key(ctx.key, ctx.commit_id.as_str());
        if let Some(enc) = ctx.cache.get_object(&key)? {
            return Ok(enc);
        }
        let enc = Arc::new(RwLock::new(CredsEncoder::new()));
        match ctx.cache.register_object(&key, &enc) {
            Ok(()) => debug!(tensor = ctx.key, "creds encoder created"),
            Err(e) if e.is_read_only() => {
                warn!(tensor = ctx.key, "read-only cache, creds encoder not registered")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(enc)
    }

    fn mark_creds_encoder(&self, ctx: &EngineContext<'_>, enc: &Shared<CredsEncoder>) -> EngineResult<()> {
        let key = keys::creds_encoder_key(ctx.key, ctx.commit_id.as_str());
        match ctx.cache.mark_dirty(&key) {
            Err(StoreError::NotFound(_)) => Ok(ctx.cache.register_object(&key, enc)?),
            other => Ok(other?),
        }
    }

    /// Credential key of sample `global`.
    pub(crate) fn creds_key_at(&self, ctx: &EngineContext<'_>, global: u64) -> EngineResult<Option<String>> {
        let id = self
            .creds_encoder(ctx)?
            .read()
            .expect("lock poisoned")
            .get_encoded_creds_key(global)?;
        self.creds.get_creds_key(id)
    }

    /// URL a media backend can stream: presigned for object stores, the
    /// path itself otherwise.
    pub fn video_url(&self, path: &str, key: Option<&str>) -> EngineResult<String> {
        match ProviderKind::for_path(path) {
            Some(kind) if kind.is_object_store() => self
                .creds
                .get_storage_provider(key, kind)?
                .presigned_url(path, self.presigned_url_full),
            _ => Ok(path.to_string()),
        }
    }

    /// Fetch and decode the whole resource.
    pub fn read_linked_sample(
        &self,
        ctx: &EngineContext<'_>,
        path: &str,
        key: Option<&str>,
    ) -> EngineResult<NdArray> {
        let compression = compression_of(path)?;
        let bytes = self.creds.read_bytes(path, key)?;
        Ok(ctx
            .pipeline
            .decode_source(compression, MediaSource::Bytes(&bytes))?)
    }

    /// Shape and dtype of a resource, reading as little as the codec allows.
    fn inspect(&self, ctx: &EngineContext<'_>, path: &str, key: Option<&str>) -> EngineResult<(Vec<usize>, DType)> {
        let compression = compression_of(path)?;
        let result = match compression.kind() {
            CompressionKind::Video => {
                let url = self.video_url(path, key)?;
                ctx.pipeline
                    .video_shape(compression, MediaSource::Url(&url))
                    .map(|shape| (shape, DType::U8))
                    .map_err(EngineError::from)
            }
            CompressionKind::Audio => self.creds.read_bytes(path, key).and_then(|bytes| {
                Ok((
                    ctx.pipeline
                        .read_shape(compression, MediaSource::Bytes(&bytes))?,
                    DType::F32,
                ))
            }),
            _ => self
                .read_linked_sample(ctx, path, key)
                .map(|a| (a.shape().to_vec(), a.dtype())),
        };
        result.map_err(|e| match e {
            EngineError::SampleCompression(inner) => EngineError::LinkVerification {
                path: path.to_string(),
                reason: inner.to_string(),
            },
            other => other,
        })
    }

    /// Decode the frames of a video selected by `sub_index`. An integer
    /// frame entry drops the frame axis.
    pub fn video_sample(
        &self,
        ctx: &EngineContext<'_>,
        path: &str,
        key: Option<&str>,
        sub_index: &[IndexEntry],
    ) -> EngineResult<NdArray> {
        let compression = compression_of(path)?;
        let url = self.video_url(path, key)?;
        let source = MediaSource::Url(&url);
        let shape = ctx.pipeline.video_shape(compression, source)?;
        let frame_entry = sub_index.first();
        let range = normalize_index(frame_entry, shape.first().copied().unwrap_or_default())?;
        let mut video = ctx.pipeline.decode_video(compression, source, range)?;

        let rest = sub_index.get(1..).unwrap_or(&[]);
        if matches!(frame_entry, Some(IndexEntry::Int(_))) {
            video.squeeze_axis(0)?;
            Ok(video.slice(rest)?)
        } else {
            let mut entries = Vec::with_capacity(sub_index.len());
            entries.push(IndexEntry::all());
            entries.extend_from_slice(rest);
            Ok(video.slice(&entries)?)
        }
    }

    /// Accept linked variants only, confirm their creds keys, and inspect
    /// each resource when the tensor verifies links.
    pub fn check_each_sample(
        &self,
        ctx: &EngineContext<'_>,
        samples: Vec<Sample>,
    ) -> EngineResult<Vec<VerifiedLink>> {
        let mut verified = Vec::with_capacity(samples.len());
        for sample in samples {
            let link = match sample {
                Sample::LinkedRef(link) => Some(link),
                Sample::LinkedTensorRef(tensor_sample) => Some(tensor_sample.link),
                Sample::Empty => None,
                other => {
                    return Err(EngineError::UnexpectedSampleType {
                        expected: "LinkedSample",
                        actual: other.variant_name(),
                    })
                }
            };
            let mut checked = VerifiedLink {
                link,
                shape: None,
                dtype: None,
            };
            self.creds.get_encoding(checked.creds_key())?;

            let path = checked.path();
            if ctx.meta.verify && !path.is_empty() {
                let (shape, dtype) = self.inspect(ctx, path, checked.creds_key())?;
                checked.shape = Some(shape);
                checked.dtype = Some(dtype);
            }
            verified.push(checked);
        }
        Ok(verified)
    }

    /// Record the credential of the first `num_added` samples.
    pub fn register_new_creds(
        &self,
        ctx: &EngineContext<'_>,
        num_added: usize,
        samples: &[VerifiedLink],
    ) -> EngineResult<()> {
        let enc = self.creds_encoder(ctx)?;
        for sample in samples.iter().take(num_added) {
            let key = sample.creds_key();
            let id = self.creds.get_encoding(key)?;
            enc.write().expect("lock poisoned").register_samples(id, 1);
            self.note_used(ctx, key)?;
        }
        self.mark_creds_encoder(ctx, &enc)
    }

    /// Persist the registry when a key is referenced for the first time.
    fn note_used(&self, ctx: &EngineContext<'_>, key: Option<&str>) -> EngineResult<()> {
        if !self.creds.add_to_used_creds(key) {
            return Ok(());
        }
        self.creds.save(ctx.cache)?;
        if let Some(k) = key {
            if !self.creds.is_managed(k) {
                warn!(
                    creds_key = k,
                    "creds key is not managed; populate it before other users read this tensor"
                );
            }
        }
        Ok(())
    }
}

impl SampleResolver for LinkedResolver {
    type Checked = VerifiedLink;

    fn is_data_cachable(&self) -> bool {
        false
    }

    fn accepts(&self, meta: &TensorMeta) -> EngineResult<()> {
        if !meta.is_link {
            return Err(EngineError::Config(format!(
                "{} tensors cannot hold linked samples",
                meta.htype
            )));
        }
        Ok(())
    }

    fn check_samples(&self, ctx: &EngineContext<'_>, samples: Vec<Sample>) -> EngineResult<Vec<VerifiedLink>> {
        self.check_each_sample(ctx, samples)
    }

    fn encode(
        &self,
        ctx: &EngineContext<'_>,
        sample: &VerifiedLink,
        _dtype: Option<DType>,
    ) -> EngineResult<EncodedSample> {
        let path = sample.path();
        let (shape, track_shape) = match &sample.shape {
            Some(shape) => {
                ctx.meta.check_shape(shape)?;
                (shape.clone(), true)
            }
            None if path.is_empty() => (vec![0], false),
            None => (Vec::new(), false),
        };
        Ok(EncodedSample {
            bytes: path.as_bytes().to_vec(),
            shape,
            dtype: sample.dtype,
            raw_nbytes: path.len() as u64,
            track_shape,
        })
    }

    fn after_extend(&self, ctx: &EngineContext<'_>, samples: &[VerifiedLink]) -> EngineResult<()> {
        self.register_new_creds(ctx, samples.len(), samples)
    }

    fn after_pop(&self, ctx: &EngineContext<'_>, count: u64) -> EngineResult<()> {
        let enc = self.creds_encoder(ctx)?;
        enc.write().expect("lock poisoned").pop(count)?;
        self.mark_creds_encoder(ctx, &enc)
    }

    fn fork(&self, ctx: &EngineContext<'_>, new_commit: &CommitId) -> EngineResult<()> {
        let from = keys::creds_encoder_key(ctx.key, ctx.commit_id.as_str());
        if let Some(enc) = ctx.cache.get_object::<CredsEncoder>(&from)? {
            let copy = enc.read().expect("lock poisoned").clone();
            ctx.cache
                .put_object(&keys::creds_encoder_key(ctx.key, new_commit.as_str()), copy)?;
        }
        Ok(())
    }

    fn materialize(
        &self,
        ctx: &EngineContext<'_>,
        global_index: u64,
        stored: StoredSample,
        sub_index: &[IndexEntry],
        opts: ReadOptions,
    ) -> EngineResult<NdArray> {
        let path = path_of(stored.bytes)?;
        let dtype = ctx.meta.dtype;
        if path.is_empty() {
            return Ok(NdArray::zeros(dtype.unwrap_or(DType::U8), vec![0]));
        }
        let key = self.creds_key_at(ctx, global_index)?;
        let array = if compression_of(&path)?.kind() == CompressionKind::Video {
            self.video_sample(ctx, &path, key.as_deref(), sub_index)?
        } else {
            self.read_linked_sample(ctx, &path, key.as_deref())?
                .slice(sub_index)?
        };
        match dtype {
            Some(d) if opts.cast && array.dtype() != d => Ok(array.cast(d)),
            _ => Ok(array),
        }
    }

    fn read_shape(
        &self,
        ctx: &EngineContext<'_>,
        global_index: u64,
        _recorded: &[usize],
        load: &dyn Fn() -> EngineResult<Vec<u8>>,
    ) -> EngineResult<Vec<usize>> {
        let path = path_of(load()?)?;
        if path.is_empty() {
            return Ok(vec![0]);
        }
        let key = self.creds_key_at(ctx, global_index)?;
        Ok(self.inspect(ctx, &path, key.as_deref())?.0)
    }
}

impl ChunkEngine<LinkedResolver> {
    /// See [`LinkedResolver::check_each_sample`].
    pub fn check_each_sample(&self, samples: Vec<Sample>) -> EngineResult<Vec<VerifiedLink>> {
        let meta = self.meta();
        let ctx = self.context(&meta);
        self.resolver().check_each_sample(&ctx, samples)
    }

    /// Stored path of sample `global_index`.
    pub fn get_path(&self, global_index: u64) -> EngineResult<String> {
        let meta = self.meta();
        self.check_index(global_index, meta.length)?;
        path_of(self.stored_sample(&meta, global_index)?.bytes)
    }

    /// Path and credential key of sample `global_index`.
    pub fn linked_sample(&self, global_index: u64) -> EngineResult<LinkedSample> {
        let path = self.get_path(global_index)?;
        let meta = self.meta();
        let creds_key = self
            .resolver()
            .creds_key_at(&self.context(&meta), global_index)?;
        Ok(LinkedSample { path, creds_key })
    }

    pub fn get_video_url(&self, global_index: u64) -> EngineResult<String> {
        let link = self.linked_sample(global_index)?;
        self.resolver()
            .video_url(&link.path, link.creds_key.as_deref())
    }

    /// Frames of a linked video. `index` starts with the sample axis.
    pub fn get_video_sample(&self, global_index: u64, index: &Index) -> EngineResult<NdArray> {
        let link = self.linked_sample(global_index)?;
        let meta = self.meta();
        self.resolver().video_sample(
            &self.context(&meta),
            &link.path,
            link.creds_key.as_deref(),
            index.sub_index(),
        )
    }

    /// The whole resource with `index` applied past the sample axis. Videos
    /// are streamed from their URL unless `fetch_chunks` asks for the whole
    /// file. An empty path yields a zero-length array.
    pub fn get_basic_sample(
        &self,
        global_index: u64,
        index: &Index,
        fetch_chunks: bool,
    ) -> EngineResult<NdArray> {
        let link = self.linked_sample(global_index)?;
        if link.path.is_empty() {
            return Ok(NdArray::zeros(self.dtype().unwrap_or(DType::U8), vec![0]));
        }
        let meta = self.meta();
        let ctx = self.context(&meta);
        let key = link.creds_key.as_deref();
        if !fetch_chunks && compression_of(&link.path)?.kind() == CompressionKind::Video {
            return self
                .resolver()
                .video_sample(&ctx, &link.path, key, index.sub_index());
        }
        Ok(self
            .resolver()
            .read_linked_sample(&ctx, &link.path, key)?
            .slice(index.sub_index())?)
    }

    /// Point sample `global_index` at a different credential key.
    pub fn update_creds(&mut self, global_index: u64, sample: Option<&LinkedSample>) -> EngineResult<()> {
        self.cache().check_writable()?;
        let meta = self.meta();
        self.check_index(global_index, meta.length)?;
        let ctx = self.context(&meta);
        let resolver = self.resolver();
        let key = sample.and_then(|s| s.creds_key.as_deref());
        let id = resolver.link_creds().get_encoding(key)?;
        let enc = resolver.creds_encoder(&ctx)?;
        enc.write().expect("lock poisoned").set(global_index, id)?;
        resolver.mark_creds_encoder(&ctx, &enc)?;
        resolver.note_used(&ctx, key)
    }

    /// Fail if stored samples reference creds keys that are not populated.
    pub fn check_link_ready(&self) -> EngineResult<()> {
        let creds = self.resolver().link_creds();
        let used = creds.used_creds_keys();
        let missing: std::collections::BTreeSet<String> = creds
            .missing_keys()
            .into_iter()
            .filter(|k| used.contains(k))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::LinkNotReady(missing))
        }
    }
}
