//! Map configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Flush policy for released versions.
///
/// A version the caller explicitly asked to flush is always flushed. A
/// version that is merely released is flushed once its own cache holds
/// `flush_threshold` entries or it has been alive for `flush_interval`;
/// otherwise it is folded into the next version's cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Cache entries (leaves plus hashes) that make a released version due.
    pub flush_threshold: usize,

    /// Age that makes a released version due. A released version waiting
    /// for its successor to seal is flushed by a timer once it reaches
    /// this age.
    #[serde(with = "vmap_types::duration_ms")]
    pub flush_interval: Duration,

    /// Compact the data source after a flush if it reports enough garbage.
    pub compact_after_flush: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 100_000,
            flush_interval: Duration::from_secs(30),
            compact_after_flush: true,
        }
    }
}

impl MapConfig {
    /// Set the entry threshold.
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Set the age threshold.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Enable or disable compaction after flush.
    pub fn with_compact_after_flush(mut self, compact: bool) -> Self {
        self.compact_after_flush = compact;
        self
    }
}
