//! Per-sample strategies plugged into the [`ChunkEngine`](crate::ChunkEngine).
//!
//! The engine owns placement, indexes, and byte accounting. What a sample
//! *is* (inline data or a link to external data) is decided by a
//! [`SampleResolver`]: it checks incoming samples, turns them into the bytes
//! a chunk stores, and turns stored bytes back into arrays.

use std::borrow::Cow;

use tc_codec::{Compression, CompressionKind, CompressionMode, MediaSource, Pipeline};
use tc_store::ObjectCache;
use tc_types::{CommitId, DType, IndexEntry, NdArray, Sample};

use crate::error::{EngineError, EngineResult};
use crate::meta::TensorMeta;

/// Everything a resolver may consult about the tensor being operated on.
#[derive(Clone, Copy)]
pub struct EngineContext<'a> {
    pub key: &'a str,
    pub commit_id: &'a CommitId,
    pub cache: &'a ObjectCache,
    pub pipeline: &'a Pipeline,
    pub meta: &'a TensorMeta,
}

/// A sample ready to be placed in a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedSample {
    /// Bytes stored in the chunk (raw in per-chunk mode).
    pub bytes: Vec<u8>,
    /// Shape recorded in the chunk's shape index.
    pub shape: Vec<usize>,
    /// Element type of the decoded sample, if known.
    pub dtype: Option<DType>,
    /// Contribution to the tensor's uncompressed byte total.
    pub raw_nbytes: u64,
    /// Whether `shape` takes part in the tensor's shape interval.
    pub track_shape: bool,
}

/// A sample as read back from its chunk.
#[derive(Clone, Debug)]
pub struct StoredSample {
    pub bytes: Vec<u8>,
    pub shape: Vec<usize>,
}

/// Options for reading a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    /// Cast the result to the tensor dtype.
    pub cast: bool,
    /// Arrays are always returned owned; kept so callers can state intent.
    pub copy: bool,
    /// With `false`, per-sample compressed tensors return the encoded bytes
    /// as a 1D `uint8` array.
    pub decompress: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            cast: true,
            copy: false,
            decompress: true,
        }
    }
}

/// Strategy for one family of samples.
pub trait SampleResolver: Send + Sync {
    /// A sample that passed [`SampleResolver::check_samples`].
    type Checked: Send;

    /// Whether decoded payloads may be kept in memory alongside chunks.
    fn is_data_cachable(&self) -> bool;

    /// Reject tensor metadata this resolver cannot serve.
    fn accepts(&self, meta: &TensorMeta) -> EngineResult<()>;

    /// Validate incoming samples, in order. Nothing has been mutated yet.
    fn check_samples(
        &self,
        ctx: &EngineContext<'_>,
        samples: Vec<Sample>,
    ) -> EngineResult<Vec<Self::Checked>>;

    /// Produce chunk bytes. `dtype` is the tensor dtype once one is fixed.
    fn encode(
        &self,
        ctx: &EngineContext<'_>,
        sample: &Self::Checked,
        dtype: Option<DType>,
    ) -> EngineResult<EncodedSample>;

    /// Called after `samples` were appended.
    fn after_extend(&self, _ctx: &EngineContext<'_>, _samples: &[Self::Checked]) -> EngineResult<()> {
        Ok(())
    }

    /// Called after the last `count` samples were removed.
    fn after_pop(&self, _ctx: &EngineContext<'_>, _count: u64) -> EngineResult<()> {
        Ok(())
    }

    /// Copy resolver-owned per-commit state to `new_commit`.
    fn fork(&self, _ctx: &EngineContext<'_>, _new_commit: &CommitId) -> EngineResult<()> {
        Ok(())
    }

    /// Turn a stored sample into the array a reader sees, applying `sub_index`.
    fn materialize(
        &self,
        ctx: &EngineContext<'_>,
        global_index: u64,
        stored: StoredSample,
        sub_index: &[IndexEntry],
        opts: ReadOptions,
    ) -> EngineResult<NdArray>;

    /// Shape of a sample. `load` fetches the stored bytes when needed.
    fn read_shape(
        &self,
        ctx: &EngineContext<'_>,
        global_index: u64,
        recorded: &[usize],
        load: &dyn Fn() -> EngineResult<Vec<u8>>,
    ) -> EngineResult<Vec<usize>>;
}

/// Samples whose data lives in the chunks.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineResolver;

impl InlineResolver {
    fn encode_array(
        &self,
        ctx: &EngineContext<'_>,
        array: &NdArray,
        dtype: Option<DType>,
    ) -> EngineResult<EncodedSample> {
        let target = dtype.unwrap_or(array.dtype());
        let array: Cow<'_, NdArray> = if array.dtype() == target {
            Cow::Borrowed(array)
        } else {
            Cow::Owned(
                array
                    .safe_cast(target)
                    .map_err(|_| EngineError::DTypeMismatch {
                        expected: target,
                        actual: array.dtype(),
                    })?,
            )
        };
        ctx.meta.check_shape(array.shape())?;

        let bytes = if array.is_empty() {
            Vec::new()
        } else if ctx.meta.storage_mode() == CompressionMode::PerSample {
            ctx.pipeline
                .encode_sample(&array, ctx.meta.storage_compression())?
        } else {
            // Per-chunk raster codecs encode later, so check the sample now.
            ctx.pipeline
                .validate(ctx.meta.storage_compression(), array.dtype(), array.shape())?;
            array.as_bytes().to_vec()
        };
        Ok(EncodedSample {
            bytes,
            shape: array.shape().to_vec(),
            dtype: Some(target),
            raw_nbytes: array.nbytes() as u64,
            track_shape: true,
        })
    }

    fn encode_file(
        &self,
        ctx: &EngineContext<'_>,
        compression: Compression,
        bytes: &[u8],
        dtype: Option<DType>,
    ) -> EngineResult<EncodedSample> {
        let source = MediaSource::Bytes(bytes);
        let verbatim = ctx.meta.storage_mode() == CompressionMode::PerSample
            && ctx.meta.storage_compression() == Some(compression);
        if !verbatim || compression.is_raster() {
            let array = ctx.pipeline.decode_source(compression, source)?;
            if !verbatim || dtype.is_some_and(|d| d != array.dtype()) {
                return self.encode_array(ctx, &array, dtype);
            }
            ctx.meta.check_shape(array.shape())?;
            return Ok(EncodedSample {
                bytes: bytes.to_vec(),
                shape: array.shape().to_vec(),
                dtype: Some(array.dtype()),
                raw_nbytes: array.nbytes() as u64,
                track_shape: true,
            });
        }

        // Media shapes come from the file header.
        let shape = ctx.pipeline.read_shape(compression, source)?;
        let native = match compression.kind() {
            CompressionKind::Audio => DType::F32,
            _ => DType::U8,
        };
        let target = dtype.unwrap_or(native);
        ctx.meta.check_shape(&shape)?;
        Ok(EncodedSample {
            bytes: bytes.to_vec(),
            raw_nbytes: (shape.iter().product::<usize>() * target.itemsize()) as u64,
            shape,
            dtype: Some(target),
            track_shape: true,
        })
    }
}

impl SampleResolver for InlineResolver {
    type Checked = Sample;

    fn is_data_cachable(&self) -> bool {
        true
    }

    fn accepts(&self, meta: &TensorMeta) -> EngineResult<()> {
        if meta.is_link {
            return Err(EngineError::Config(format!(
                "{} tensors need a linked chunk engine",
                meta.htype
            )));
        }
        Ok(())
    }

    fn check_samples(&self, _ctx: &EngineContext<'_>, samples: Vec<Sample>) -> EngineResult<Vec<Sample>> {
        for sample in &samples {
            if matches!(sample, Sample::LinkedRef(_) | Sample::LinkedTensorRef(_)) {
                return Err(EngineError::UnexpectedSampleType {
                    expected: "RawArray, Compressed or Empty",
                    actual: sample.variant_name(),
                });
            }
        }
        Ok(samples)
    }

    fn encode(
        &self,
        ctx: &EngineContext<'_>,
        sample: &Sample,
        dtype: Option<DType>,
    ) -> EngineResult<EncodedSample> {
        match sample {
            Sample::RawArray(array) => self.encode_array(ctx, array, dtype),
            Sample::Compressed(file) => {
                let compression: Compression = file.compression.parse()?;
                self.encode_file(ctx, compression, &file.bytes, dtype)
            }
            Sample::Empty => Ok(EncodedSample {
                bytes: Vec::new(),
                shape: vec![0; ctx.meta.max_shape.len().max(1)],
                dtype,
                raw_nbytes: 0,
                track_shape: false,
            }),
            other => Err(EngineError::UnexpectedSampleType {
                expected: "RawArray, Compressed or Empty",
                actual: other.variant_name(),
            }),
        }
    }

    fn materialize(
        &self,
        ctx: &EngineContext<'_>,
        _global_index: u64,
        stored: StoredSample,
        sub_index: &[IndexEntry],
        opts: ReadOptions,
    ) -> EngineResult<NdArray> {
        let meta = ctx.meta;
        let dtype = meta.dtype.unwrap_or(DType::U8);
        let mode = meta.storage_mode();

        if !opts.decompress && mode == CompressionMode::PerSample {
            let len = stored.bytes.len();
            return Ok(NdArray::from_bytes(DType::U8, vec![len], stored.bytes)?);
        }
        let numel: usize = stored.shape.iter().product();
        let array = if stored.bytes.is_empty() && numel == 0 {
            NdArray::zeros(dtype, stored.shape)
        } else if mode == CompressionMode::PerSample {
            ctx.pipeline.decode_sample(
                &stored.bytes,
                meta.storage_compression(),
                dtype,
                &stored.shape,
            )?
        } else {
            NdArray::from_bytes(dtype, stored.shape, stored.bytes)?
        };

        let array = array.slice(sub_index)?;
        if opts.cast && array.dtype() != dtype {
            Ok(array.cast(dtype))
        } else {
            Ok(array)
        }
    }

    fn read_shape(
        &self,
        _ctx: &EngineContext<'_>,
        _global_index: u64,
        recorded: &[usize],
        _load: &dyn Fn() -> EngineResult<Vec<u8>>,
    ) -> EngineResult<Vec<usize>> {
        Ok(recorded.to_vec())
    }
}
