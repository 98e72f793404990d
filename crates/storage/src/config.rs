//! Storage configuration.

use serde::{Deserialize, Serialize};

/// Configuration shared by the data source backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Fsync data files before the header is rewritten on every save.
    pub sync_writes: bool,

    /// Compact the disk leaf log once this fraction of it is garbage.
    pub compaction_garbage_ratio: f64,

    /// Largest encoded leaf record accepted, in bytes.
    pub max_record_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_writes: true,
            compaction_garbage_ratio: 0.5,
            max_record_size: 16 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Config for tests and throwaway maps: no fsync.
    pub fn unsynced() -> Self {
        Self {
            sync_writes: false,
            ..Default::default()
        }
    }

    /// Set the compaction threshold.
    pub fn with_compaction_garbage_ratio(mut self, ratio: f64) -> Self {
        self.compaction_garbage_ratio = ratio;
        self
    }

    /// Set the record size limit.
    pub fn with_max_record_size(mut self, limit: u32) -> Self {
        self.max_record_size = limit;
        self
    }
}
