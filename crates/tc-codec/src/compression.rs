//! Compression names and capabilities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A named codec.
///
/// The serialized form is the canonical name. Aliases are accepted by
/// [`FromStr`] only, so a name stored in tensor metadata is never
/// re-resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Compression {
    Png,
    Jpeg,
    Lz4,
    Zstd,
    Mp3,
    Flac,
    Wav,
    Mp4,
    Mkv,
    Avi,
}

/// What a codec operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionKind {
    /// Lossless image codec.
    LosslessRaster,
    /// Lossy image codec.
    LossyRaster,
    /// Generic block compression over raw bytes.
    Byte,
    Audio,
    Video,
}

/// Granularity at which a tensor compresses its data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    /// Raw bytes.
    #[default]
    None,
    /// Every sample encoded on its own.
    PerSample,
    /// The concatenated chunk payload encoded once.
    PerChunk,
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "no",
            Self::PerSample => "per-sample",
            Self::PerChunk => "per-chunk",
        })
    }
}

/// `(alias, canonical)` pairs. Canonical names resolve to themselves.
const ALIASES: &[(&str, Compression)] = &[
    ("png", Compression::Png),
    ("jpeg", Compression::Jpeg),
    ("jpg", Compression::Jpeg),
    ("lz4", Compression::Lz4),
    ("zstd", Compression::Zstd),
    ("zst", Compression::Zstd),
    ("zstandard", Compression::Zstd),
    ("mp3", Compression::Mp3),
    ("flac", Compression::Flac),
    ("wav", Compression::Wav),
    ("wave", Compression::Wav),
    ("mp4", Compression::Mp4),
    ("m4v", Compression::Mp4),
    ("mkv", Compression::Mkv),
    ("matroska", Compression::Mkv),
    ("avi", Compression::Avi),
];

impl Compression {
    pub const ALL: [Compression; 10] = [
        Self::Png,
        Self::Jpeg,
        Self::Lz4,
        Self::Zstd,
        Self::Mp3,
        Self::Flac,
        Self::Wav,
        Self::Mp4,
        Self::Mkv,
        Self::Avi,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::Wav => "wav",
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Avi => "avi",
        }
    }

    pub const fn kind(&self) -> CompressionKind {
        match self {
            Self::Png => CompressionKind::LosslessRaster,
            Self::Jpeg => CompressionKind::LossyRaster,
            Self::Lz4 | Self::Zstd => CompressionKind::Byte,
            Self::Mp3 | Self::Flac | Self::Wav => CompressionKind::Audio,
            Self::Mp4 | Self::Mkv | Self::Avi => CompressionKind::Video,
        }
    }

    pub const fn is_lossless(&self) -> bool {
        matches!(
            self,
            Self::Png | Self::Lz4 | Self::Zstd | Self::Flac | Self::Wav
        )
    }

    pub const fn is_raster(&self) -> bool {
        matches!(
            self.kind(),
            CompressionKind::LosslessRaster | CompressionKind::LossyRaster
        )
    }

    pub const fn is_media(&self) -> bool {
        matches!(self.kind(), CompressionKind::Audio | CompressionKind::Video)
    }

    /// Whether the codec can be applied at `mode` granularity.
    ///
    /// Every codec works per sample. Byte codecs compress a chunk payload
    /// directly and raster codecs pack a chunk's images into one; media
    /// formats only exist as whole files.
    pub const fn supports(&self, mode: CompressionMode) -> bool {
        match mode {
            CompressionMode::None | CompressionMode::PerSample => true,
            CompressionMode::PerChunk => !self.is_media(),
        }
    }
}

impl Compression {
    /// Compression implied by a file path or URL extension.
    pub fn from_path(path: &str) -> Result<Self, CodecError> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let file = path.rsplit('/').next().unwrap_or(path);
        match file.rsplit_once('.') {
            Some((_, ext)) => ext.parse(),
            None => Err(CodecError::UnknownCompression(file.to_string())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = CodecError;

    /// Resolve a canonical name or alias, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == lower)
            .map(|(_, c)| *c)
            .ok_or_else(|| CodecError::UnknownCompression(s.to_string()))
    }
}

impl TryFrom<String> for Compression {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Compression> for String {
    fn from(c: Compression) -> Self {
        c.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_resolve_to_themselves() {
        for c in Compression::ALL {
            assert_eq!(c.name().parse::<Compression>().unwrap(), c);
        }
    }

    #[test]
    fn aliases_are_idempotent() {
        let alias: Compression = "JPG".parse().unwrap();
        let canonical: Compression = "jpeg".parse().unwrap();
        assert_eq!(alias, canonical);
        assert_eq!(alias.name().parse::<Compression>().unwrap(), alias);
        assert_eq!("zst".parse::<Compression>().unwrap(), Compression::Zstd);
    }

    #[test]
    fn unknown_name() {
        assert!(matches!(
            "gif".parse::<Compression>(),
            Err(CodecError::UnknownCompression(_))
        ));
    }

    #[test]
    fn from_path_uses_extension() {
        assert_eq!(Compression::from_path("a/b/cat.JPG").unwrap(), Compression::Jpeg);
        assert_eq!(
            Compression::from_path("https://host/v.mp4?sig=abc").unwrap(),
            Compression::Mp4
        );
        assert!(Compression::from_path("s3://bucket/noext").is_err());
    }

    #[test]
    fn media_codecs_never_compress_chunks() {
        assert!(Compression::Lz4.supports(CompressionMode::PerChunk));
        assert!(Compression::Zstd.supports(CompressionMode::PerChunk));
        assert!(Compression::Png.supports(CompressionMode::PerChunk));
        assert!(Compression::Jpeg.supports(CompressionMode::PerChunk));
        assert!(!Compression::Mp4.supports(CompressionMode::PerChunk));
        assert!(!Compression::Wav.supports(CompressionMode::PerChunk));
        assert!(Compression::Png.supports(CompressionMode::PerSample));
    }

    #[test]
    fn serializes_canonical_name() {
        let json = serde_json::to_string(&Compression::Jpeg).unwrap();
        assert_eq!(json, "\"jpeg\"");
        let back: Compression = serde_json::from_str("\"jpg\"").unwrap();
        assert_eq!(back, Compression::Jpeg);
    }
}
