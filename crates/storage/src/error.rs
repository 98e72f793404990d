//! Error types for storage backends.

use thiserror::Error;

/// Errors raised by a data source.
///
/// I/O and corruption errors are fatal for the affected instance: the node
/// must recover its state from a peer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted after `close()`.
    #[error("Data source is closed")]
    Closed,

    /// Stored bytes do not decode to what the index says they should.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Record or header (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Files were written by an incompatible format version.
    #[error("Unsupported format version {found}, expected {expected}")]
    UnsupportedFormat {
        /// Version found on disk.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// A leaf record exceeds the configured size limit.
    #[error("Record too large: {size} bytes (limit {limit})")]
    RecordTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured limit.
        limit: u32,
    },
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Storage result type.
pub type Result<T> = std::result::Result<T, StorageError>;
