//! Sample variants accepted by `extend`.
//!
//! The variant is decided once, where the caller builds the [`Sample`], and
//! is never re-inspected below the engine boundary.

use serde::{Deserialize, Serialize};

use crate::array::NdArray;

/// A reference to externally hosted data.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkedSample {
    /// Local path, public URL, or object-storage URL (`s3://`, `gcs://`, ...).
    pub path: String,
    /// Credential key used to access `path`. `None` means no credential.
    pub creds_key: Option<String>,
}

impl LinkedSample {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            creds_key: None,
        }
    }

    pub fn with_creds(path: impl Into<String>, creds_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            creds_key: Some(creds_key.into()),
        }
    }
}

/// A sample read out of another linked tensor, carrying its resolved link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedTensorSample {
    pub source_tensor: String,
    pub source_index: u64,
    pub link: LinkedSample,
}

/// Pre-encoded bytes with a known compression, e.g. an image file read from disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedSample {
    /// Compression name as found on the input (an alias such as `"jpg"` is fine).
    pub compression: String,
    pub bytes: Vec<u8>,
}

impl CompressedSample {
    pub fn new(compression: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            compression: compression.into(),
            bytes,
        }
    }

    /// Read a file, taking the compression from its extension.
    pub fn read(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let compression = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Ok(Self {
            compression,
            bytes: std::fs::read(path)?,
        })
    }
}

/// A single logical array unit offered to a tensor.
#[derive(Clone, Debug, PartialEq)]
pub enum Sample {
    /// Dense data held in memory.
    RawArray(NdArray),
    /// Already-encoded data (see [`CompressedSample`]).
    Compressed(CompressedSample),
    /// Path + credential key, no inline bytes.
    LinkedRef(LinkedSample),
    /// A sample of another linked tensor.
    LinkedTensorRef(LinkedTensorSample),
    /// Zero-length placeholder.
    Empty,
}

impl Sample {
    /// Variant name, used in type-mismatch errors.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::RawArray(_) => "RawArray",
            Self::Compressed(_) => "Compressed",
            Self::LinkedRef(_) => "LinkedRef",
            Self::LinkedTensorRef(_) => "LinkedTensorRef",
            Self::Empty => "Empty",
        }
    }

    pub fn link(path: impl Into<String>, creds_key: Option<&str>) -> Self {
        Self::LinkedRef(LinkedSample {
            path: path.into(),
            creds_key: creds_key.map(str::to_string),
        })
    }
}

impl From<NdArray> for Sample {
    fn from(array: NdArray) -> Self {
        Self::RawArray(array)
    }
}

impl From<CompressedSample> for Sample {
    fn from(sample: CompressedSample) -> Self {
        Self::Compressed(sample)
    }
}

impl From<LinkedSample> for Sample {
    fn from(link: LinkedSample) -> Self {
        Self::LinkedRef(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names() {
        assert_eq!(Sample::Empty.variant_name(), "Empty");
        assert_eq!(Sample::link("a.png", None).variant_name(), "LinkedRef");
        let arr = NdArray::filled(vec![1], 0u8);
        assert_eq!(Sample::from(arr).variant_name(), "RawArray");
    }

    #[test]
    fn read_takes_extension() {
        let dir = std::env::temp_dir().join(format!("tc-types-sample-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("picture.JPG");
        std::fs::write(&path, b"not really a jpeg").unwrap();
        let sample = CompressedSample::read(&path).unwrap();
        assert_eq!(sample.compression, "jpg");
        assert_eq!(sample.bytes, b"not really a jpeg");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
