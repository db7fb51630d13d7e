//! Per-tensor metadata, one document per tensor commit.

use serde::{Deserialize, Serialize};
use tc_codec::{Compression, CompressionKind, CompressionMode};
use tc_store::{CacheObject, StoreError, StoreResult};
use tc_types::DType;

use crate::config::{EngineConfig, Htype, HtypeKind, TensorConfig};
use crate::error::{EngineError, EngineResult};

/// Tensor metadata, persisted as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub htype: Htype,
    pub dtype: Option<DType>,
    pub sample_compression: Option<Compression>,
    pub chunk_compression: Option<Compression>,
    pub max_chunk_size: u64,
    pub is_link: bool,
    pub verify: bool,
    pub length: u64,
    /// Elementwise minimum over stored sample shapes.
    pub min_shape: Vec<usize>,
    /// Elementwise maximum over stored sample shapes.
    pub max_shape: Vec<usize>,
    pub num_compressed_bytes: u64,
    pub num_uncompressed_bytes: u64,
}

fn parse_compression(name: Option<&str>) -> EngineResult<Option<Compression>> {
    match name {
        None => Ok(None),
        Some(n) if n.eq_ignore_ascii_case("none") => Ok(None),
        Some(n) => n
            .parse()
            .map(Some)
            .map_err(|_| EngineError::UnsupportedCompression(n.to_string())),
    }
}

impl TensorMeta {
    /// Resolve and validate creation options.
    pub fn new(config: &TensorConfig, defaults: &EngineConfig) -> EngineResult<Self> {
        let htype: Htype = match &config.htype {
            Some(h) => h.parse()?,
            None => Htype::GENERIC,
        };
        let sample_compression = parse_compression(config.sample_compression.as_deref())?;
        let chunk_compression = parse_compression(config.chunk_compression.as_deref())?;

        if sample_compression.is_some() && chunk_compression.is_some() {
            return Err(EngineError::MutuallyExclusiveCompression);
        }
        if let Some(c) = chunk_compression {
            if htype.is_link || !c.supports(CompressionMode::PerChunk) {
                return Err(EngineError::UnsupportedCompressionMode {
                    compression: c,
                    mode: CompressionMode::PerChunk,
                });
            }
        }
        if !htype.is_link {
            check_htype_compression(htype, sample_compression, chunk_compression)?;
        }

        let dtype = match &config.dtype {
            Some(d) => Some(d.parse::<DType>()?),
            None if htype.kind == HtypeKind::Image && !htype.is_link => Some(DType::U8),
            None => None,
        };
        let max_chunk_size = config
            .max_chunk_size
            .unwrap_or(defaults.default_max_chunk_size);
        if max_chunk_size == 0 {
            return Err(EngineError::Config("max_chunk_size must be positive".into()));
        }

        Ok(Self {
            htype,
            dtype,
            sample_compression,
            chunk_compression,
            max_chunk_size,
            is_link: htype.is_link,
            verify: htype.is_link && config.verify.unwrap_or(defaults.verify_links),
            length: 0,
            min_shape: Vec::new(),
            max_shape: Vec::new(),
            num_compressed_bytes: 0,
            num_uncompressed_bytes: 0,
        })
    }

    /// How chunk payloads are compressed. Link tensors always store raw paths.
    pub fn storage_mode(&self) -> CompressionMode {
        if self.is_link {
            CompressionMode::None
        } else if self.chunk_compression.is_some() {
            CompressionMode::PerChunk
        } else if self.sample_compression.is_some() {
            CompressionMode::PerSample
        } else {
            CompressionMode::None
        }
    }

    /// The codec applied at [`TensorMeta::storage_mode`] granularity.
    pub fn storage_compression(&self) -> Option<Compression> {
        match self.storage_mode() {
            CompressionMode::None => None,
            CompressionMode::PerSample => self.sample_compression,
            CompressionMode::PerChunk => self.chunk_compression,
        }
    }

    /// Widen the shape interval to include `shape`.
    pub fn update_shape_interval(&mut self, shape: &[usize]) -> EngineResult<()> {
        if self.min_shape.is_empty() && self.max_shape.is_empty() {
            self.min_shape = shape.to_vec();
            self.max_shape = shape.to_vec();
            return Ok(());
        }
        if shape.len() != self.min_shape.len() {
            return Err(EngineError::ShapeDimMismatch {
                expected: self.min_shape.len(),
                actual: shape.len(),
            });
        }
        for (axis, &dim) in shape.iter().enumerate() {
            self.min_shape[axis] = self.min_shape[axis].min(dim);
            self.max_shape[axis] = self.max_shape[axis].max(dim);
        }
        Ok(())
    }

    /// Fail if `shape` cannot join the shape interval.
    pub fn check_shape(&self, shape: &[usize]) -> EngineResult<()> {
        if !self.min_shape.is_empty() && shape.len() != self.min_shape.len() {
            return Err(EngineError::ShapeDimMismatch {
                expected: self.min_shape.len(),
                actual: shape.len(),
            });
        }
        Ok(())
    }
}

fn check_htype_compression(
    htype: Htype,
    sample: Option<Compression>,
    chunk: Option<Compression>,
) -> EngineResult<()> {
    let missing = || EngineError::MissingRequiredValue {
        htype: htype.to_string(),
        key: "sample_compression".into(),
    };
    match htype.kind {
        HtypeKind::Generic => Ok(()),
        HtypeKind::Image => match (sample, chunk) {
            (None, None) => Err(missing()),
            (Some(c), _) if c.is_media() => Err(EngineError::UnsupportedCompressionMode {
                compression: c,
                mode: CompressionMode::PerSample,
            }),
            _ => Ok(()),
        },
        HtypeKind::Audio | HtypeKind::Video => {
            let expected = if htype.kind == HtypeKind::Audio {
                CompressionKind::Audio
            } else {
                CompressionKind::Video
            };
            match sample {
                Some(c) if c.kind() == expected => Ok(()),
                Some(c) => Err(EngineError::UnsupportedCompressionMode {
                    compression: c,
                    mode: CompressionMode::PerSample,
                }),
                None => Err(missing()),
            }
        }
    }
}

impl CacheObject for TensorMeta {
    fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(config: TensorConfig) -> EngineResult<TensorMeta> {
        TensorMeta::new(&config, &EngineConfig::default())
    }

    #[test]
    fn aliases_resolve_at_creation() {
        let a = meta(TensorConfig::new().sample_compression("jpg")).unwrap();
        let b = meta(TensorConfig::new().sample_compression("jpeg")).unwrap();
        assert_eq!(a.sample_compression, b.sample_compression);
        assert_eq!(a.sample_compression, Some(Compression::Jpeg));
        let json = String::from_utf8(a.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"jpeg\""));
    }

    #[test]
    fn unsupported_compression() {
        assert!(matches!(
            meta(TensorConfig::new().sample_compression("bad_compression")),
            Err(EngineError::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn image_requires_compression() {
        assert!(matches!(
            meta(TensorConfig::new().htype("image")),
            Err(EngineError::MissingRequiredValue { .. })
        ));
        let m = meta(TensorConfig::new().htype("image").sample_compression("png")).unwrap();
        assert_eq!(m.dtype, Some(DType::U8));
        assert_eq!(m.storage_mode(), CompressionMode::PerSample);
    }

    #[test]
    fn compressions_are_mutually_exclusive() {
        assert!(matches!(
            meta(
                TensorConfig::new()
                    .htype("image")
                    .sample_compression("png")
                    .chunk_compression("lz4")
            ),
            Err(EngineError::MutuallyExclusiveCompression)
        ));
    }

    #[test]
    fn images_compress_per_chunk() {
        for name in ["jpg", "png", "lz4"] {
            let m = meta(TensorConfig::new().htype("image").chunk_compression(name)).unwrap();
            assert_eq!(m.storage_mode(), CompressionMode::PerChunk);
            assert_eq!(m.storage_compression(), m.chunk_compression);
        }
        assert!(matches!(
            meta(TensorConfig::new().chunk_compression("mp4")),
            Err(EngineError::UnsupportedCompressionMode { .. })
        ));
    }

    #[test]
    fn video_needs_video_codec() {
        assert!(meta(TensorConfig::new().htype("video").sample_compression("mp4")).is_ok());
        assert!(meta(TensorConfig::new().htype("video").sample_compression("png")).is_err());
    }

    #[test]
    fn link_tensors_store_paths_raw() {
        let m = meta(TensorConfig::new().htype("link[image]").sample_compression("png")).unwrap();
        assert!(m.is_link);
        assert!(m.verify);
        assert_eq!(m.storage_mode(), CompressionMode::None);
        assert_eq!(m.dtype, None);
    }

    #[test]
    fn shape_interval_widens() {
        let mut m = meta(TensorConfig::new()).unwrap();
        m.update_shape_interval(&[900, 900, 3]).unwrap();
        m.update_shape_interval(&[513, 464, 4]).unwrap();
        assert_eq!(m.min_shape, vec![513, 464, 3]);
        assert_eq!(m.max_shape, vec![900, 900, 4]);
        assert!(matches!(
            m.update_shape_interval(&[1, 1]),
            Err(EngineError::ShapeDimMismatch { .. })
        ));
    }
}
