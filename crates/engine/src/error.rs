//! Error types for map operations.

use thiserror::Error;
use vmap_storage::StorageError;

/// Errors raised by a [`crate::VirtualMap`].
#[derive(Debug, Error)]
pub enum MapError {
    /// Mutation attempted on a sealed version.
    #[error("Version {generation} is sealed and cannot be modified")]
    ImmutableState {
        /// Generation of the sealed version.
        generation: u64,
    },

    /// Operation needs a sealed version but was called on the mutable head.
    #[error("Version {generation} is still mutable")]
    NotSealed {
        /// Generation of the head.
        generation: u64,
    },

    /// The data source failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The head was mutated while an iterator over it was live.
    #[error("Version {generation} was modified during iteration")]
    ConcurrentModification {
        /// Generation being iterated.
        generation: u64,
    },

    /// Background hashing of a version failed.
    #[error("Hashing failed: {0}")]
    Hashing(String),

    /// Background flush of a version failed.
    #[error("Flush failed: {0}")]
    Flush(String),

    /// A newer version reached the data source before the snapshot was taken.
    #[error("Cannot snapshot version {requested}: data source already holds version {flushed}")]
    SnapshotStale {
        /// Version asked for.
        requested: u64,
        /// Version the data source now holds.
        flushed: u64,
    },

    /// Restored state does not match its manifest.
    #[error("Corrupt map state: {0}")]
    Corrupt(String),
}

/// Map result type.
pub type Result<T> = std::result::Result<T, MapError>;
