use std::sync::Arc;

use tc_types::{DType, NdArray};
use tracing::trace;

use crate::bytes;
use crate::compression::{Compression, CompressionKind, CompressionMode};
use crate::error::{CodecError, CodecResult};
use crate::media::{FrameRange, MediaBackend, MediaSource};
use crate::raster;

/// Codec dispatch for the engine.
///
/// `None` as the compression means raw little-endian element bytes.
#[derive(Clone, Default)]
pub struct Pipeline {
    media: Option<Arc<dyn MediaBackend>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("media", &self.media.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            media: Some(backend),
        }
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    fn media(&self, compression: Compression) -> CodecResult<&dyn MediaBackend> {
        self.media
            .as_deref()
            .ok_or(CodecError::NoMediaBackend(compression))
    }

    /// Fail unless `compression` can be applied at `mode` granularity.
    pub fn check_mode(compression: Compression, mode: CompressionMode) -> CodecResult<()> {
        if compression.supports(mode) {
            Ok(())
        } else {
            Err(CodecError::UnsupportedMode { compression, mode })
        }
    }

    /// Check that a raw array of `dtype`/`shape` can be encoded per sample.
    pub fn validate(
        &self,
        compression: Option<Compression>,
        dtype: DType,
        shape: &[usize],
    ) -> CodecResult<()> {
        match compression {
            Some(c) if c.is_raster() => raster::validate(c, dtype, shape),
            Some(c) if c.is_media() => Err(CodecError::constraint(
                c,
                "raw arrays cannot be encoded as media; append the encoded file instead",
            )),
            _ => Ok(()),
        }
    }

    /// Encode one sample on its own.
    pub fn encode_sample(
        &self,
        array: &NdArray,
        compression: Option<Compression>,
    ) -> CodecResult<Vec<u8>> {
        let Some(c) = compression else {
            return Ok(array.as_bytes().to_vec());
        };
        self.validate(compression, array.dtype(), array.shape())?;
        let out = match c.kind() {
            CompressionKind::LosslessRaster | CompressionKind::LossyRaster => {
                raster::encode(c, array)?
            }
            CompressionKind::Byte => bytes::compress(c, array.as_bytes())?,
            CompressionKind::Audio | CompressionKind::Video => {
                return Err(CodecError::constraint(c, "raw arrays cannot be encoded as media"))
            }
        };
        trace!(compression = %c, raw = array.nbytes(), encoded = out.len(), "sample encoded");
        Ok(out)
    }

    /// Decode one sample. `shape` is the recorded shape of the sample; the
    /// decoded array is reshaped to it.
    pub fn decode_sample(
        &self,
        data: &[u8],
        compression: Option<Compression>,
        dtype: DType,
        shape: &[usize],
    ) -> CodecResult<NdArray> {
        let Some(c) = compression else {
            return Ok(NdArray::from_bytes(dtype, shape.to_vec(), data.to_vec())?);
        };
        let decoded = match c.kind() {
            CompressionKind::LosslessRaster | CompressionKind::LossyRaster => raster::decode(c, data)?,
            CompressionKind::Byte => {
                let raw = bytes::decompress(c, data)?;
                return Ok(NdArray::from_bytes(dtype, shape.to_vec(), raw)?);
            }
            CompressionKind::Audio => self.media(c)?.decode_audio(c, MediaSource::Bytes(data))?,
            CompressionKind::Video => {
                let frames = shape.first().copied().unwrap_or_default();
                let range = FrameRange {
                    start: 0,
                    stop: frames,
                    step: 1,
                    reverse: false,
                };
                self.media(c)?
                    .decode_video(c, MediaSource::Bytes(data), range)?
            }
        };
        conform(c, decoded, shape)
    }

    /// Decode a complete encoded file whose shape is not known up front.
    pub fn decode_source(&self, compression: Compression, source: MediaSource<'_>) -> CodecResult<NdArray> {
        match (compression.kind(), source) {
            (CompressionKind::LosslessRaster | CompressionKind::LossyRaster, MediaSource::Bytes(b)) => {
                raster::decode(compression, b)
            }
            (CompressionKind::Audio, source) => self.media(compression)?.decode_audio(compression, source),
            (CompressionKind::Video, source) => {
                let backend = self.media(compression)?;
                let shape = backend.video_shape(compression, source)?;
                let range = FrameRange {
                    start: 0,
                    stop: shape.first().copied().unwrap_or_default(),
                    step: 1,
                    reverse: false,
                };
                backend.decode_video(compression, source, range)
            }
            (CompressionKind::Byte, _) => Err(CodecError::MissingShape(compression)),
            (_, MediaSource::Url(url)) => Err(CodecError::decode(
                compression,
                format!("{url} must be fetched before decoding"),
            )),
        }
    }

    /// Shape of an encoded sample read from its header.
    pub fn read_shape(&self, compression: Compression, source: MediaSource<'_>) -> CodecResult<Vec<usize>> {
        match (compression.kind(), source) {
            (CompressionKind::LosslessRaster | CompressionKind::LossyRaster, MediaSource::Bytes(b)) => {
                raster::read_shape(compression, b)
            }
            (CompressionKind::Audio, source) => self.media(compression)?.audio_shape(compression, source),
            (CompressionKind::Video, source) => self.media(compression)?.video_shape(compression, source),
            (CompressionKind::Byte, _) => Err(CodecError::MissingShape(compression)),
            (_, MediaSource::Url(url)) => Err(CodecError::decode(
                compression,
                format!("{url} must be fetched before reading its header"),
            )),
        }
    }

    pub fn video_shape(&self, compression: Compression, source: MediaSource<'_>) -> CodecResult<Vec<usize>> {
        self.media(compression)?.video_shape(compression, source)
    }

    pub fn decode_video(
        &self,
        compression: Compression,
        source: MediaSource<'_>,
        range: FrameRange,
    ) -> CodecResult<NdArray> {
        self.media(compression)?.decode_video(compression, source, range)
    }

    /// Compress a whole chunk payload. `data` holds the chunk's samples back
    /// to back with the given `shapes`; raster codecs pack them into one
    /// image, byte codecs ignore the shapes.
    pub fn compress_chunk(
        &self,
        data: &[u8],
        compression: Compression,
        shapes: &[&[usize]],
    ) -> CodecResult<Vec<u8>> {
        Self::check_mode(compression, CompressionMode::PerChunk)?;
        let out = if compression.is_raster() {
            raster::pack(compression, data, shapes)?
        } else {
            bytes::compress(compression, data)?
        };
        trace!(compression = %compression, samples = shapes.len(), raw = data.len(), encoded = out.len(), "chunk compressed");
        Ok(out)
    }

    pub fn decompress_chunk(
        &self,
        data: &[u8],
        compression: Compression,
        shapes: &[&[usize]],
    ) -> CodecResult<Vec<u8>> {
        Self::check_mode(compression, CompressionMode::PerChunk)?;
        if compression.is_raster() {
            raster::unpack(compression, data, shapes)
        } else {
            bytes::decompress(compression, data)
        }
    }

    /// Whether samples of `shapes` can live in one chunk compressed as
    /// `compression`. Raster chunks need a common channel count and must
    /// stay within the codec's image size limits.
    pub fn can_share_chunk(compression: Compression, shapes: &[&[usize]]) -> bool {
        !compression.is_raster() || raster::can_pack(compression, shapes)
    }

    /// Encode an array at the given granularity.
    ///
    /// In per-chunk mode this compresses the array's raw bytes as if they
    /// were a complete chunk payload.
    pub fn encode(
        &self,
        array: &NdArray,
        compression: Option<Compression>,
        mode: CompressionMode,
    ) -> CodecResult<Vec<u8>> {
        match (mode, compression) {
            (CompressionMode::None, _) | (_, None) => Ok(array.as_bytes().to_vec()),
            (CompressionMode::PerSample, c) => self.encode_sample(array, c),
            (CompressionMode::PerChunk, Some(c)) => {
                self.validate(compression, array.dtype(), array.shape())?;
                self.compress_chunk(array.as_bytes(), c, &[array.shape()])
            }
        }
    }

    /// Inverse of [`Pipeline::encode`].
    pub fn decode(
        &self,
        data: &[u8],
        compression: Option<Compression>,
        mode: CompressionMode,
        dtype: DType,
        shape: &[usize],
    ) -> CodecResult<NdArray> {
        match (mode, compression) {
            (CompressionMode::None, _) | (_, None) => {
                Ok(NdArray::from_bytes(dtype, shape.to_vec(), data.to_vec())?)
            }
            (CompressionMode::PerSample, c) => self.decode_sample(data, c, dtype, shape),
            (CompressionMode::PerChunk, Some(c)) => {
                let raw = self.decompress_chunk(data, c, &[shape])?;
                Ok(NdArray::from_bytes(dtype, shape.to_vec(), raw)?)
            }
        }
    }
}

/// Reshape a decoded array to the recorded shape, which may carry or drop a
/// trailing single-channel axis.
fn conform(compression: Compression, decoded: NdArray, shape: &[usize]) -> CodecResult<NdArray> {
    if shape.is_empty() || decoded.shape() == shape {
        return Ok(decoded);
    }
    if decoded.num_elements() != shape.iter().product::<usize>() {
        return Err(CodecError::Decode {
            compression,
            reason: format!(
                "decoded shape {:?} does not match recorded shape {shape:?}",
                decoded.shape()
            ),
        });
    }
    Ok(decoded.reshape(shape.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeVideo;

    impl MediaBackend for FakeVideo {
        fn decode_audio(&self, _: Compression, _: MediaSource<'_>) -> CodecResult<NdArray> {
            Ok(NdArray::zeros(DType::F32, vec![100, 2]))
        }

        fn audio_shape(&self, _: Compression, _: MediaSource<'_>) -> CodecResult<Vec<usize>> {
            Ok(vec![100, 2])
        }

        fn video_shape(&self, _: Compression, _: MediaSource<'_>) -> CodecResult<Vec<usize>> {
            Ok(vec![10, 2, 2, 3])
        }

        fn decode_video(
            &self,
            _: Compression,
            _: MediaSource<'_>,
            range: FrameRange,
        ) -> CodecResult<NdArray> {
            let frames = range.frames();
            let mut data = Vec::new();
            for f in &frames {
                data.extend(std::iter::repeat(*f as u8).take(12));
            }
            Ok(NdArray::from_bytes(DType::U8, vec![frames.len(), 2, 2, 3], data)?)
        }
    }

    #[test]
    fn raw_passthrough() {
        let p = Pipeline::new();
        let a = NdArray::filled(vec![3, 2], 9i32);
        let enc = p.encode(&a, None, CompressionMode::None).unwrap();
        assert_eq!(enc.len(), a.nbytes());
        let dec = p.decode(&enc, None, CompressionMode::None, DType::I32, &[3, 2]).unwrap();
        assert_eq!(dec, a);
    }

    #[test]
    fn grayscale_png_keeps_channel_axis() {
        let p = Pipeline::new();
        let a = NdArray::filled(vec![4, 4, 1], 200u8);
        let enc = p.encode_sample(&a, Some(Compression::Png)).unwrap();
        let dec = p.decode_sample(&enc, Some(Compression::Png), DType::U8, &[4, 4, 1]).unwrap();
        assert_eq!(dec, a);
    }

    #[test]
    fn byte_codec_per_chunk() {
        let p = Pipeline::new();
        let a = NdArray::filled(vec![64], 1u16);
        let enc = p.encode(&a, Some(Compression::Lz4), CompressionMode::PerChunk).unwrap();
        let dec = p
            .decode(&enc, Some(Compression::Lz4), CompressionMode::PerChunk, DType::U16, &[64])
            .unwrap();
        assert_eq!(dec, a);
    }

    #[test]
    fn media_rejected_per_chunk() {
        let p = Pipeline::new();
        assert!(matches!(
            p.compress_chunk(b"abc", Compression::Mp4, &[&[3]]),
            Err(CodecError::UnsupportedMode { .. })
        ));
    }

    #[test]
    fn png_chunk_holds_several_images() {
        let p = Pipeline::new();
        let a = NdArray::filled(vec![4, 6, 3], 10u8);
        let b = NdArray::filled(vec![2, 9, 3], 20u8);
        let mut raw = a.as_bytes().to_vec();
        raw.extend_from_slice(b.as_bytes());
        let shapes: [&[usize]; 2] = [a.shape(), b.shape()];
        let packed = p.compress_chunk(&raw, Compression::Png, &shapes).unwrap();
        assert_eq!(
            p.read_shape(Compression::Png, MediaSource::Bytes(&packed)).unwrap(),
            vec![6, 9, 3]
        );
        assert_eq!(p.decompress_chunk(&packed, Compression::Png, &shapes).unwrap(), raw);
        assert!(!Pipeline::can_share_chunk(Compression::Png, &[&[4, 6, 3], &[4, 6, 4]]));
        assert!(Pipeline::can_share_chunk(Compression::Lz4, &[&[4, 6, 3], &[4, 6, 4]]));
    }

    #[test]
    fn jpeg_per_chunk_round_trip_is_close() {
        let p = Pipeline::new();
        let values: Vec<u8> = (0..16 * 16 * 3).map(|i| ((i / 3) % 16 * 8) as u8).collect();
        let a = NdArray::from_vec(vec![16, 16, 3], values).unwrap();
        let enc = p.encode(&a, Some(Compression::Jpeg), CompressionMode::PerChunk).unwrap();
        let dec = p
            .decode(&enc, Some(Compression::Jpeg), CompressionMode::PerChunk, DType::U8, &[16, 16, 3])
            .unwrap();
        assert_eq!(dec.shape(), &[16, 16, 3]);
        let diff: u64 = a
            .as_bytes()
            .iter()
            .zip(dec.as_bytes())
            .map(|(x, y)| x.abs_diff(*y) as u64)
            .sum();
        assert!(diff / (a.nbytes() as u64) < 8, "mean error {}", diff / a.nbytes() as u64);
        let four = NdArray::filled(vec![4, 4, 4], 1u8);
        assert!(p.encode(&four, Some(Compression::Jpeg), CompressionMode::PerChunk).is_err());
    }

    #[test]
    fn media_needs_backend() {
        let p = Pipeline::new();
        assert!(matches!(
            p.read_shape(Compression::Mp4, MediaSource::Url("clip.mp4")),
            Err(CodecError::NoMediaBackend(Compression::Mp4))
        ));
        let arr = NdArray::zeros(DType::U8, vec![1, 2, 2, 3]);
        assert!(matches!(
            p.encode_sample(&arr, Some(Compression::Mp4)),
            Err(CodecError::Constraint { .. })
        ));
    }

    #[test]
    fn video_through_backend() {
        let p = Pipeline::with_media(Arc::new(FakeVideo));
        let shape = p.read_shape(Compression::Mp4, MediaSource::Url("clip.mp4")).unwrap();
        assert_eq!(shape, vec![10, 2, 2, 3]);
        let all = p.decode_source(Compression::Mp4, MediaSource::Url("clip.mp4")).unwrap();
        assert_eq!(all.shape(), &[10, 2, 2, 3]);
        let dec = p.decode_sample(b"", Some(Compression::Mp4), DType::U8, &[10, 2, 2, 3]).unwrap();
        assert_eq!(dec.shape(), &[10, 2, 2, 3]);
    }

    #[test]
    fn mismatched_recorded_shape() {
        let p = Pipeline::new();
        let a = NdArray::filled(vec![2, 2], 1u8);
        let enc = p.encode_sample(&a, Some(Compression::Png)).unwrap();
        assert!(matches!(
            p.decode_sample(&enc, Some(Compression::Png), DType::U8, &[3, 3]),
            Err(CodecError::Decode { .. })
        ));
    }
}
