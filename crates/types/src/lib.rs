//! Core types for the virtual map storage engine.
//!
//! Everything here is plain data plus pure functions:
//!
//! - [`Hash`]: 32-byte Blake3 digest used for every tree node
//! - [`path`]: index arithmetic for the complete binary tree
//! - [`LeafRecord`] / [`HashRecord`]: the wire/disk representation of tree content
//! - [`MapMetadata`]: the `(first_leaf_path, last_leaf_path, size)` shape descriptor
//! - [`merkle`]: leaf and internal node hash functions
//! - [`duration_ms`]: serde adapter for millisecond config durations

pub mod duration_ms;
mod hash;
pub mod merkle;
mod metadata;
pub mod path;
mod record;

pub use hash::{Hash, HexError};
pub use merkle::{empty_root_hash, hash_internal, hash_leaf};
pub use metadata::{DeletePlan, InsertPlan, LeafMove, MapMetadata};
pub use path::{Path, INVALID_PATH, ROOT_PATH};
pub use record::{HashRecord, LeafRecord};
