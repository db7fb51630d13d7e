//! Run-length indexes for tensorchunk.
//!
//! A tensor maps every sample index onto a handful of per-sample values: the
//! chunk holding it, its shape, its byte range inside that chunk, and (for
//! linked tensors) its credential id. Consecutive samples usually share the
//! value, so all four mappings are stored as runs of `(value, count)` in one
//! generic structure, [`RunLengthIndex`].
//!
//! # Key Types
//!
//! - [`RunLengthIndex`] -- generic run-length map with binary-search lookup
//! - [`ChunkIdEncoder`] -- sample index -> chunk id, per tensor commit
//! - [`ShapeEncoder`] -- local sample index -> shape, per chunk
//! - [`BytePositionsEncoder`] -- local sample index -> byte range, per chunk
//! - [`CredsEncoder`] -- sample index -> credential id, per tensor commit

pub mod bytes;
pub mod chunk_id;
pub mod creds;
pub mod error;
pub mod rle;
pub mod shape;

pub use bytes::BytePositionsEncoder;
pub use chunk_id::{ChunkId, ChunkIdEncoder};
pub use creds::CredsEncoder;
pub use error::{IndexError, IndexResult};
pub use rle::RunLengthIndex;
pub use shape::ShapeEncoder;
