//! Foundation types for tensorchunk.
//!
//! This crate provides the value types every other tensorchunk crate speaks:
//! element types, dense arrays, the sample variants accepted at append time,
//! sub-indexing, and commit identifiers.
//!
//! # Key Types
//!
//! - [`DType`] -- element type of a tensor (`uint8`, `float32`, ...)
//! - [`NdArray`] -- dynamically typed, row-major dense array
//! - [`Sample`] -- tagged input variant resolved once at the `extend` boundary
//! - [`Index`] / [`IndexEntry`] -- numpy-style integer and slice indexing
//! - [`CommitId`] -- identifier of a version snapshot

pub mod array;
pub mod commit;
pub mod dtype;
pub mod error;
pub mod index;
pub mod sample;

pub use array::{Element, NdArray, Scalar};
pub use commit::{CommitId, FIRST_COMMIT_ID};
pub use dtype::DType;
pub use error::{TypeError, TypeResult};
pub use index::{slice_indices, Index, IndexEntry};
pub use sample::{CompressedSample, LinkedSample, LinkedTensorSample, Sample};
