//! The data source contract.

use crate::{
    BackendKind, DiskDataSource, MemoryDataSource, Result, SnapshotManifest, StorageConfig,
};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use vmap_types::{Hash, HashRecord, LeafRecord, MapMetadata};

/// A lazy, finite, single-pass sequence of records handed to
/// [`DataSource::save_records`].
pub type RecordIter<'a, T> = Box<dyn Iterator<Item = T> + Send + 'a>;

/// What a data source holds at a hash path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSlot {
    /// Nothing was ever saved at the path.
    Unwritten,
    /// The path was cut off when the tree shrank.
    Deleted,
    Present(Hash),
}

impl HashSlot {
    pub fn hash(self) -> Option<Hash> {
        match self {
            HashSlot::Present(hash) => Some(hash),
            HashSlot::Unwritten | HashSlot::Deleted => None,
        }
    }
}

/// Persistent storage behind a family of map versions.
///
/// Implementations are shared by every version anchored to them and must be
/// safe for concurrent readers. Writes come from a single writer at a time
/// (the flush worker or a reconnect learner). A write becomes visible to
/// subsequent loads on the same instance once `save_records` returns.
///
/// Every method fails with [`crate::StorageError::Closed`] after
/// [`DataSource::close`].
pub trait DataSource: Send + Sync + fmt::Debug {
    /// Tree shape as of the last save.
    fn metadata(&self) -> Result<MapMetadata>;

    /// Look up a leaf by key.
    fn load_leaf_by_key(&self, key: &[u8]) -> Result<Option<LeafRecord>>;

    /// Look up the leaf currently stored at `path`.
    fn load_leaf_by_path(&self, path: u64) -> Result<Option<LeafRecord>>;

    /// Look up the hash slot at `path`, telling tombstoned paths apart from
    /// paths never written.
    fn load_hash_slot(&self, path: u64) -> Result<HashSlot>;

    /// Look up the hash stored at `path`. Tombstoned and unwritten paths
    /// both resolve to `None`.
    fn load_hash(&self, path: u64) -> Result<Option<Hash>> {
        Ok(self.load_hash_slot(path)?.hash())
    }

    /// Bulk write of one flush.
    ///
    /// Deletions are applied before additions. All three iterators are fully
    /// consumed before returning. After the write, every path beyond
    /// `last_leaf_path` that belonged to the previous tree is tombstoned.
    ///
    /// With `reconnect_context` set, a deletion only takes effect while the
    /// key is still stored at the deletion's path: during reconnect a key may
    /// already have been re-added somewhere else.
    fn save_records(
        &self,
        first_leaf_path: u64,
        last_leaf_path: u64,
        hashes: RecordIter<'_, HashRecord>,
        leaves_to_add: RecordIter<'_, LeafRecord>,
        leaves_to_delete: RecordIter<'_, LeafRecord>,
        reconnect_context: bool,
    ) -> Result<()>;

    /// Write a self-contained copy of the current state to `directory`.
    fn snapshot(&self, directory: &Path) -> Result<()>;

    /// Create an independent data source holding a copy of the current
    /// state. Disk backends place the copy in `directory`.
    fn fork(&self, directory: &Path) -> Result<Arc<dyn DataSource>>;

    /// Reclaim space held by overwritten or deleted records.
    fn compact(&self) -> Result<()> {
        Ok(())
    }

    /// Whether compaction would currently reclaim enough to be worthwhile.
    fn needs_compaction(&self) -> bool {
        false
    }

    /// Release resources. With `keep_data == false` the stored data is
    /// discarded as well.
    fn close(&self, keep_data: bool) -> Result<()>;

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}

/// Open a snapshot directory with whichever backend wrote it.
pub fn open_snapshot(directory: &Path, config: StorageConfig) -> Result<Arc<dyn DataSource>> {
    let manifest = SnapshotManifest::read(directory)?;
    Ok(match manifest.backend {
        BackendKind::Memory => Arc::new(MemoryDataSource::restore(directory, config)?),
        BackendKind::Disk => Arc::new(DiskDataSource::open(directory, config)?),
    })
}

/// Shape written by a save, and the path range the save cut off.
///
/// Paths in the returned range belonged to the previous tree and now lie
/// beyond the last leaf. When the new tree is empty everything below the
/// root goes.
pub(crate) fn shape_after_save(
    old: &MapMetadata,
    first_leaf_path: u64,
    last_leaf_path: u64,
) -> (MapMetadata, std::ops::RangeInclusive<u64>) {
    let next = if first_leaf_path == vmap_types::INVALID_PATH {
        MapMetadata::EMPTY
    } else {
        MapMetadata {
            first_leaf_path,
            last_leaf_path,
            size: last_leaf_path - first_leaf_path + 1,
        }
    };
    let start = if next.is_empty() { 1 } else { last_leaf_path + 1 };
    let end = if old.is_empty() { 0 } else { old.last_leaf_path };
    (next, start..=end)
}
