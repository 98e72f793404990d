//! Error types for reconnect sessions.

use crate::codec::CodecError;
use thiserror::Error;
use vmap_engine::MapError;
use vmap_storage::StorageError;

/// Why a reconnect session ended without a complete tree.
///
/// Every variant aborts the whole session. The learner's original data
/// source is untouched, so the caller may retry against any teacher.
#[derive(Debug, Error)]
pub enum ReconnectError {
    /// A peer did not answer in time, or the session ran out of budget.
    #[error("Timed out waiting for {waiting_for}")]
    Timeout {
        /// What the session was waiting for.
        waiting_for: &'static str,
    },

    /// A received leaf does not hash to what the teacher claimed.
    #[error("Leaf at path {path} does not match its announced hash")]
    HashMismatch {
        /// Path of the offending leaf.
        path: u64,
    },

    /// The peer sent something the protocol does not allow here.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading a map version failed.
    #[error("Map error: {0}")]
    Map(#[from] MapError),

    /// Writing the learner's tree failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The peer gave up.
    #[error("Aborted by peer: {reason}")]
    Aborted {
        /// Reason the peer sent.
        reason: String,
    },
}

impl ReconnectError {
    /// Whether the peer should be told about this failure.
    ///
    /// Broken streams and peer aborts leave nobody to tell.
    pub fn should_notify_peer(&self) -> bool {
        !matches!(
            self,
            ReconnectError::Io(_)
                | ReconnectError::Aborted { .. }
                | ReconnectError::Codec(CodecError::Io(_) | CodecError::Closed)
        )
    }
}

/// Reconnect result type.
pub type Result<T> = std::result::Result<T, ReconnectError>;
