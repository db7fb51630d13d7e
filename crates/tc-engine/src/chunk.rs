//! Chunks: capacity-bounded buffers of encoded samples.
//!
//! Binary layout (integers are LEB128 varints unless noted):
//!
//! ```text
//! "TCHK" | version: u32 BE | mode: u8
//! shape runs:    n | n x (ndim | dims... | count)
//! byte runs:     n | n x (size | count)
//! payload:       len | bytes
//! crc32 of everything above: u32 BE
//! ```
//!
//! Byte runs describe the samples inside the *uncompressed* payload. In
//! per-chunk mode the stored payload is the compressed form of that buffer;
//! raster codecs compress it as one image built from the shape runs.

use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tc_codec::{Compression, CompressionMode, Pipeline};
use tc_index::{BytePositionsEncoder, ChunkId, ShapeEncoder};
use tc_store::{CacheObject, StoreError, StoreResult};

use crate::error::{EngineError, EngineResult};
use crate::resolver::EncodedSample;

const MAGIC: &[u8; 4] = b"TCHK";
const VERSION: u32 = 1;

/// A run of samples in one storage object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    mode: CompressionMode,
    shapes: ShapeEncoder,
    positions: BytePositionsEncoder,
    /// Stored payload.
    data: Vec<u8>,
    /// Decompressed payload, per-chunk mode only. Never persisted.
    raw: Option<Vec<u8>>,
}

impl Chunk {
    pub fn new(mode: CompressionMode) -> Self {
        Self {
            mode,
            shapes: ShapeEncoder::new(),
            positions: BytePositionsEncoder::new(),
            data: Vec::new(),
            raw: None,
        }
    }

    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    pub fn num_samples(&self) -> u64 {
        self.shapes.num_samples()
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    /// Size of the stored payload.
    pub fn nbytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn shapes(&self) -> &ShapeEncoder {
        &self.shapes
    }

    pub fn positions(&self) -> &BytePositionsEncoder {
        &self.positions
    }

    pub fn shape(&self, local: u64) -> EngineResult<&[usize]> {
        Ok(self.shapes.shape(local)?)
    }

    pub fn has_raw(&self) -> bool {
        self.raw.is_some()
    }

    fn payload<'a>(
        &'a self,
        pipeline: &Pipeline,
        compression: Option<Compression>,
    ) -> EngineResult<Cow<'a, [u8]>> {
        match (self.mode, compression) {
            (CompressionMode::PerChunk, Some(c)) => match &self.raw {
                Some(raw) => Ok(Cow::Borrowed(raw)),
                None if self.data.is_empty() => Ok(Cow::Borrowed(&[])),
                None => {
                    let shapes = sample_shapes(&self.shapes);
                    Ok(Cow::Owned(pipeline.decompress_chunk(&self.data, c, &shapes)?))
                }
            },
            _ => Ok(Cow::Borrowed(&self.data)),
        }
    }

    /// Keep the decompressed payload in memory (per-chunk mode).
    pub fn load_raw(&mut self, pipeline: &Pipeline, compression: Option<Compression>) -> EngineResult<()> {
        if self.mode == CompressionMode::PerChunk && self.raw.is_none() {
            let raw = self.payload(pipeline, compression)?.into_owned();
            self.raw = Some(raw);
        }
        Ok(())
    }

    /// Bytes of sample `local` as stored (per-sample encoded, or raw).
    pub fn sample_bytes(
        &self,
        local: u64,
        pipeline: &Pipeline,
        compression: Option<Compression>,
    ) -> EngineResult<Vec<u8>> {
        let (start, end) = self.positions.range(local)?;
        let payload = self.payload(pipeline, compression)?;
        payload
            .get(start as usize..end as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| EngineError::Corrupt {
                key: format!("sample {local}"),
                reason: format!("byte range {start}..{end} exceeds payload of {}", payload.len()),
            })
    }

    /// Append one sample unless that would push a non-empty chunk past
    /// `max_size`, or the chunk's codec cannot hold it next to the samples
    /// already here. Returns the change in stored size, or `None` if the
    /// sample belongs in a new chunk.
    pub fn try_append(
        &mut self,
        sample: &EncodedSample,
        pipeline: &Pipeline,
        compression: Option<Compression>,
        max_size: Option<u64>,
    ) -> EngineResult<Option<i64>> {
        let old = self.nbytes() as i64;
        let non_empty = !self.is_empty();
        let over = |len: usize| non_empty && max_size.is_some_and(|m| len as u64 > m);

        match (self.mode, compression) {
            (CompressionMode::PerChunk, Some(c)) => {
                self.load_raw(pipeline, compression)?;
                let mut shapes = sample_shapes(&self.shapes);
                shapes.push(&sample.shape);
                if non_empty && !Pipeline::can_share_chunk(c, &shapes) {
                    return Ok(None);
                }
                let mut raw = self.raw.take().unwrap_or_default();
                let before = raw.len();
                raw.extend_from_slice(&sample.bytes);
                let packed = pipeline.compress_chunk(&raw, c, &shapes)?;
                if over(packed.len()) {
                    raw.truncate(before);
                    self.raw = Some(raw);
                    return Ok(None);
                }
                self.raw = Some(raw);
                self.data = packed;
            }
            _ => {
                if over(self.data.len() + sample.bytes.len()) {
                    return Ok(None);
                }
                self.data.extend_from_slice(&sample.bytes);
            }
        }
        self.shapes.register(&sample.shape);
        self.positions.register(sample.bytes.len() as u64);
        Ok(Some(self.nbytes() as i64 - old))
    }

    /// Remove the last `count` samples. Returns the change in stored size.
    pub fn pop(
        &mut self,
        count: u64,
        pipeline: &Pipeline,
        compression: Option<Compression>,
    ) -> EngineResult<i64> {
        let n = self.num_samples();
        if count > n {
            return Err(EngineError::CannotPop(format!(
                "chunk holds {n} samples, {count} requested"
            )));
        }
        if count == 0 {
            return Ok(0);
        }
        let old = self.nbytes() as i64;
        let cut = self.positions.range(n - count)?.0 as usize;
        self.shapes.pop(count)?;
        self.positions.pop(count)?;

        match (self.mode, compression) {
            (CompressionMode::PerChunk, Some(c)) => {
                self.load_raw(pipeline, compression)?;
                let mut raw = self.raw.take().unwrap_or_default();
                raw.truncate(cut);
                self.data = if raw.is_empty() {
                    Vec::new()
                } else {
                    pipeline.compress_chunk(&raw, c, &sample_shapes(&self.shapes))?
                };
                self.raw = Some(raw);
            }
            _ => self.data.truncate(cut),
        }
        Ok(self.nbytes() as i64 - old)
    }

    /// Copy of this chunk for another owner, without the in-memory cache.
    pub fn duplicate(&self) -> Self {
        Self {
            raw: None,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 64);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.push(mode_byte(self.mode));

        let shape_runs: Vec<_> = self.shapes.runs().collect();
        encode_varint(&mut buf, shape_runs.len() as u64);
        for (shape, count) in shape_runs {
            encode_varint(&mut buf, shape.len() as u64);
            for &dim in shape {
                encode_varint(&mut buf, dim as u64);
            }
            encode_varint(&mut buf, count);
        }

        let byte_runs: Vec<_> = self.positions.runs().collect();
        encode_varint(&mut buf, byte_runs.len() as u64);
        for (size, count) in byte_runs {
            encode_varint(&mut buf, size);
            encode_varint(&mut buf, count);
        }

        encode_varint(&mut buf, self.data.len() as u64);
        buf.extend_from_slice(&self.data);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, String> {
        if data.len() < 13 {
            return Err("too short".into());
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(body) != expected {
            return Err("crc32 mismatch".into());
        }
        if &body[0..4] != MAGIC {
            return Err(format!(
                "invalid magic {:?}",
                String::from_utf8_lossy(&body[0..4])
            ));
        }
        let version = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        if version != VERSION {
            return Err(format!("unsupported version {version}"));
        }
        let mode = mode_from_byte(body[8])?;

        let mut r = Reader { data: body, pos: 9 };
        let n = r.varint()?;
        let mut shape_runs = Vec::new();
        for _ in 0..n {
            let ndim = r.varint()? as usize;
            let mut shape = Vec::with_capacity(ndim.min(32));
            for _ in 0..ndim {
                shape.push(r.varint()? as usize);
            }
            shape_runs.push((shape, r.varint()?));
        }
        let n = r.varint()?;
        let mut byte_runs = Vec::new();
        for _ in 0..n {
            let size = r.varint()?;
            byte_runs.push((size, r.varint()?));
        }
        let len = r.varint()? as usize;
        let payload = r.take(len)?.to_vec();
        if r.pos != body.len() {
            return Err("trailing bytes".into());
        }

        let chunk = Self {
            mode,
            shapes: ShapeEncoder::from_runs(shape_runs),
            positions: BytePositionsEncoder::from_runs(byte_runs),
            data: payload,
            raw: None,
        };
        if chunk.shapes.num_samples() != chunk.positions.num_samples() {
            return Err("shape and byte runs cover different sample counts".into());
        }
        if mode != CompressionMode::PerChunk && chunk.positions.num_bytes() != chunk.nbytes() {
            return Err("byte runs do not cover the payload".into());
        }
        Ok(chunk)
    }
}

impl CacheObject for Chunk {
    fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(self.encode())
    }

    fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Self::decode(bytes).map_err(|reason| StoreError::Corrupt {
            key: "chunk".into(),
            reason,
        })
    }

    fn flush_priority(&self) -> u8 {
        0
    }
}

/// Chunks created in one tensor commit. Only these may be mutated by it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    pub ids: BTreeSet<ChunkId>,
}

impl CacheObject for ChunkSet {
    fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Shape of every sample, in order.
fn sample_shapes(shapes: &ShapeEncoder) -> Vec<&[usize]> {
    shapes
        .runs()
        .flat_map(|(shape, count)| std::iter::repeat(shape.as_slice()).take(count as usize))
        .collect()
}

fn mode_byte(mode: CompressionMode) -> u8 {
    match mode {
        CompressionMode::None => 0,
        CompressionMode::PerSample => 1,
        CompressionMode::PerChunk => 2,
    }
}

fn mode_from_byte(b: u8) -> Result<CompressionMode, String> {
    match b {
        0 => Ok(CompressionMode::None),
        1 => Ok(CompressionMode::PerSample),
        2 => Ok(CompressionMode::PerChunk),
        other => Err(format!("unknown compression mode {other}")),
    }
}

fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn varint(&mut self) -> Result<u64, String> {
        let mut value: u64 = 0;
        let mut shift = 0;
        while let Some(&byte) = self.data.get(self.pos) {
            self.pos += 1;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err("varint overflow".into());
            }
        }
        Err("truncated varint".into())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(len).ok_or("length overflow")?;
        let out = self.data.get(self.pos..end).ok_or("payload truncated")?;
        self.pos = end;
        Ok(out)
    }
}
