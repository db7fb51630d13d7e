//! Compression for tensorchunk.
//!
//! A tensor stores its samples under at most one named [`Compression`],
//! applied either to every sample on its own or to a whole chunk payload
//! ([`CompressionMode`]). The [`Pipeline`] is the single entry point the
//! engine calls: it validates codec constraints, encodes, decodes, and reads
//! shapes without decoding pixel data where the format allows it.
//!
//! Raster images (PNG, JPEG) and generic byte codecs (LZ4, Zstandard) are
//! implemented here. Audio and video decoding is delegated to a pluggable
//! [`MediaBackend`].

pub mod bytes;
pub mod compression;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod raster;

pub use compression::{Compression, CompressionKind, CompressionMode};
pub use error::{CodecError, CodecResult};
pub use media::{FrameRange, MediaBackend, MediaSource};
pub use pipeline::Pipeline;
