//! Engine-wide settings and per-tensor creation options.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Engine-wide defaults, loadable from TOML.
///
/// ```toml
/// default_max_chunk_size = 16777216
/// verify_links = true
/// presigned_url_full = true
/// link_fetch_timeout_secs = 30
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk capacity for tensors that do not set their own.
    pub default_max_chunk_size: u64,
    /// Reserved for chunk rebalancing; not consulted when appending.
    pub min_chunk_size_ratio: f64,
    /// Whether new link tensors inspect each linked resource at append time.
    pub verify_links: bool,
    /// Whether presigned video URLs carry the full signature.
    pub presigned_url_full: bool,
    /// Request timeout when fetching `http(s)://` links.
    pub link_fetch_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_chunk_size: 16 * 1024 * 1024,
            min_chunk_size_ratio: 0.5,
            verify_links: true,
            presigned_url_full: true,
            link_fetch_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.default_max_chunk_size == 0 {
            return Err(EngineError::Config(
                "default_max_chunk_size must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_chunk_size_ratio) {
            return Err(EngineError::Config(
                "min_chunk_size_ratio must be within [0, 1]".into(),
            ));
        }
        if self.link_fetch_timeout_secs == 0 {
            return Err(EngineError::Config(
                "link_fetch_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Semantic category of a tensor's samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HtypeKind {
    Generic,
    Image,
    Audio,
    Video,
}

impl HtypeKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Declared htype, e.g. `image` or `link[video]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Htype {
    pub kind: HtypeKind,
    pub is_link: bool,
}

impl Htype {
    pub const GENERIC: Htype = Htype {
        kind: HtypeKind::Generic,
        is_link: false,
    };

    pub fn link(kind: HtypeKind) -> Self {
        Self {
            kind,
            is_link: true,
        }
    }
}

impl Default for Htype {
    fn default() -> Self {
        Self::GENERIC
    }
}

impl fmt::Display for Htype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_link {
            write!(f, "link[{}]", self.kind.name())
        } else {
            f.write_str(self.kind.name())
        }
    }
}

impl FromStr for Htype {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (inner, is_link) = match s.strip_prefix("link[").and_then(|r| r.strip_suffix(']')) {
            Some(inner) => (inner, true),
            None if s == "link" => ("generic", true),
            None => (s, false),
        };
        let kind = match inner {
            "generic" | "" => HtypeKind::Generic,
            "image" => HtypeKind::Image,
            "audio" => HtypeKind::Audio,
            "video" => HtypeKind::Video,
            _ => return Err(EngineError::UnknownHtype(s.to_string())),
        };
        Ok(Self { kind, is_link })
    }
}

impl TryFrom<String> for Htype {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Htype> for String {
    fn from(h: Htype) -> Self {
        h.to_string()
    }
}

/// Creation-time options for one tensor. Names are resolved once, when the
/// tensor is created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorConfig {
    pub htype: Option<String>,
    pub dtype: Option<String>,
    pub sample_compression: Option<String>,
    pub chunk_compression: Option<String>,
    pub max_chunk_size: Option<u64>,
    /// Link tensors only. Defaults to [`EngineConfig::verify_links`].
    pub verify: Option<bool>,
}

impl TensorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn htype(mut self, htype: impl Into<String>) -> Self {
        self.htype = Some(htype.into());
        self
    }

    pub fn dtype(mut self, dtype: impl Into<String>) -> Self {
        self.dtype = Some(dtype.into());
        self
    }

    pub fn sample_compression(mut self, name: impl Into<String>) -> Self {
        self.sample_compression = Some(name.into());
        self
    }

    pub fn chunk_compression(mut self, name: impl Into<String>) -> Self {
        self.chunk_compression = Some(name.into());
        self
    }

    pub fn max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = Some(size);
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = EngineConfig::default();
        assert_eq!(c.default_max_chunk_size, 16 * 1024 * 1024);
        assert!(c.verify_links);
        assert!(c.presigned_url_full);
        assert_eq!(c.link_fetch_timeout_secs, 30);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = EngineConfig::from_toml_str("verify_links = false\n").unwrap();
        assert!(!c.verify_links);
        assert_eq!(c.default_max_chunk_size, 16 * 1024 * 1024);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = EngineConfig::from_toml_str("default_max_chunk_size = 0").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(EngineConfig::from_toml_str("verify_links = 3").is_err());
    }

    #[test]
    fn rejects_zero_link_timeout() {
        let err = EngineConfig::from_toml_str("link_fetch_timeout_secs = 0").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        let c = EngineConfig::from_toml_str("link_fetch_timeout_secs = 5").unwrap();
        assert_eq!(c.link_fetch_timeout_secs, 5);
    }

    #[test]
    fn htype_names() {
        assert_eq!("image".parse::<Htype>().unwrap().kind, HtypeKind::Image);
        let linked: Htype = "link[video]".parse().unwrap();
        assert!(linked.is_link);
        assert_eq!(linked.kind, HtypeKind::Video);
        assert_eq!(linked.to_string(), "link[video]");
        assert!("link".parse::<Htype>().unwrap().is_link);
        assert!(matches!(
            "point_cloud".parse::<Htype>(),
            Err(EngineError::UnknownHtype(_))
        ));
    }
}
