//! Persistent storage for the virtual map.
//!
//! A [`DataSource`] holds the flushed state of a map: leaf records addressable
//! by key and by path, node hashes addressable by path, and the tree shape.
//! Map versions only ever read from it; the flush worker (or a reconnect
//! learner) writes to it through [`DataSource::save_records`].
//!
//! # Backends
//!
//! - [`MemoryDataSource`] - hash maps behind a lock, for tests and tiny maps
//! - [`DiskDataSource`] - an append-only leaf log plus fixed-width path and
//!   hash index files
//!
//! Both snapshot to a self-contained directory described by a
//! [`SnapshotManifest`] and can be restored from it losslessly.

mod config;
mod disk;
mod error;
mod manifest;
mod memory;
mod source;

pub use config::StorageConfig;
pub use disk::DiskDataSource;
pub use error::{Result, StorageError};
pub use manifest::{BackendKind, SnapshotManifest, MANIFEST_FILE, SNAPSHOT_FORMAT_VERSION};
pub use memory::MemoryDataSource;
pub use source::{open_snapshot, DataSource, HashSlot, RecordIter};
