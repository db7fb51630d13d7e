//! Chunk engine for tensorchunk.
//!
//! A tensor is an append-only sequence of samples stored in capacity-bounded
//! chunks. The [`ChunkEngine`] places samples, keeps the per-commit indexes
//! (chunk ids, shapes, byte ranges), and maintains byte counters
//! incrementally. What a sample is gets decided by a [`SampleResolver`]:
//!
//! - [`InlineResolver`]: sample data lives in the chunks, optionally
//!   compressed per sample or per chunk.
//! - [`LinkedResolver`]: chunks hold only paths to external data; each
//!   sample's credential is tracked in a creds encoder and resolved through
//!   the dataset's [`LinkCreds`] registry.
//!
//! # Write model
//!
//! One writer per tensor commit. Every `extend` checks and encodes the whole
//! batch before mutating anything. Nothing is durable until
//! [`ChunkEngine::flush`]; chunks are written before the indexes that point
//! at them.

pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod link_creds;
pub mod linked;
pub mod meta;
pub mod resolver;
pub mod video;

pub use chunk::{Chunk, ChunkSet};
pub use config::{EngineConfig, Htype, HtypeKind, TensorConfig};
pub use engine::{ChunkEngine, InlineChunkEngine};
pub use error::{EngineError, EngineResult};
pub use http::{HttpFactory, HttpStorage};
pub use link_creds::{
    Creds, LinkCreds, LinkedStorage, OfflineFactory, ProviderFactory, ProviderKind, ENV_CREDS_KEY,
};
pub use linked::{LinkedChunkEngine, LinkedResolver, VerifiedLink};
pub use meta::TensorMeta;
pub use resolver::{EncodedSample, EngineContext, InlineResolver, ReadOptions, SampleResolver, StoredSample};
pub use video::normalize_index;
