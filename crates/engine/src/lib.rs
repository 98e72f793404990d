//! Versioned copy-on-write virtual map.
//!
//! A [`VirtualMap`] is one version of a merkle-hashed key/value map whose
//! leaves sit on the leaf level of a full binary tree. Versions form a chain:
//!
//! ```text
//!   head (mutable)  ->  sealed v2  ->  sealed v1  ->  DataSource
//!   NodeCache           NodeCache      NodeCache
//! ```
//!
//! Each version's [`NodeCache`] holds only what that version changed; lookups
//! fall through the chain to the data source. Sealed versions are hashed,
//! merged and flushed by a background pipeline running on a rayon pool
//! supplied at construction.
//!
//! # Modules
//!
//! - [`NodeCache`]: per-version overlay of leaves and hashes
//! - [`FlushSet`]: the records one flush writes
//! - [`verify_tree`]: full recomputation check for a sealed version

mod cache;
mod config;
mod error;
mod flush;
mod hasher;
mod map;
mod pipeline;
mod version;

pub use cache::NodeCache;
pub use config::MapConfig;
pub use error::{MapError, Result};
pub use flush::FlushSet;
pub use hasher::verify_tree;
pub use map::{Leaves, VirtualMap};
