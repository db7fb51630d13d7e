//! Generic block compression over raw bytes.

use crate::compression::Compression;
use crate::error::{CodecError, CodecResult};

const ZSTD_LEVEL: i32 = 3;

pub fn compress(compression: Compression, data: &[u8]) -> CodecResult<Vec<u8>> {
    match compression {
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Zstd => {
            zstd::encode_all(data, ZSTD_LEVEL).map_err(|e| CodecError::encode(compression, e))
        }
        other => Err(CodecError::constraint(other, "not a byte codec")),
    }
}

pub fn decompress(compression: Compression, data: &[u8]) -> CodecResult<Vec<u8>> {
    match compression {
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::decode(compression, e)),
        Compression::Zstd => zstd::decode_all(data).map_err(|e| CodecError::decode(compression, e)),
        other => Err(CodecError::constraint(other, "not a byte codec")),
    }
}
