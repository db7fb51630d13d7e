//! Storage layer for tensorchunk.
//!
//! A [`StorageProvider`] is a durable `key -> bytes` store. The
//! [`ObjectCache`] sits in front of it, holds typed in-memory objects
//! (chunks, encoders, metadata) keyed by their storage key, and writes dirty
//! entries back on an explicit [`ObjectCache::flush`].
//!
//! # Storage Backends
//!
//! - [`MemoryProvider`] -- `HashMap`-based provider for tests and embedding
//! - [`LocalProvider`] -- one file per key under a root directory
//!
//! # Design Rules
//!
//! 1. Keys are a pure function of `(tensor, commit, structure kind)`; see [`keys`].
//! 2. Nothing is durable until `flush`; a [`WriteSession`] flushes on scope exit.
//! 3. A read-only cache refuses every write with [`StoreError::ReadOnly`].
//! 4. Chunk payloads are flushed before the indexes that point at them.

pub mod cache;
pub mod error;
pub mod keys;
pub mod local;
pub mod memory;
pub mod session;
pub mod traits;

pub use cache::{CacheObject, ObjectCache, Shared};
pub use error::{StoreError, StoreResult};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use session::WriteSession;
pub use traits::StorageProvider;
