//! Records written to the data source by one flush.

use crate::cache::{CachedHash, CachedLeaf, NodeCache};
use vmap_storage::{DataSource, Result};
use vmap_types::{HashRecord, LeafRecord, MapMetadata};

/// Everything one `save_records` call writes.
///
/// Built from a version's cache when the pipeline flushes it, or filled in
/// piecewise by a reconnect learner that writes straight into a data source.
#[derive(Debug, Clone, Default)]
pub struct FlushSet {
    /// Shape of the tree after the write.
    pub metadata: MapMetadata,

    /// Node hashes to store.
    pub hashes: Vec<HashRecord>,

    /// Leaves to store at their paths.
    pub leaves_to_add: Vec<LeafRecord>,

    /// Leaves to remove. Carry the path they were deleted at.
    pub leaves_to_delete: Vec<LeafRecord>,
}

impl FlushSet {
    /// An empty set for a tree of the given shape.
    pub fn new(metadata: MapMetadata) -> Self {
        Self {
            metadata,
            ..Default::default()
        }
    }

    /// Collect a cache's changes against the shape of its version.
    pub(crate) fn from_cache(cache: &NodeCache, metadata: MapMetadata) -> Self {
        let mut set = Self::new(metadata);
        for entry in cache.key_entries() {
            match entry {
                CachedLeaf::Live(leaf) if metadata.is_leaf(leaf.path) => {
                    set.leaves_to_add.push(leaf)
                }
                CachedLeaf::Live(_) => {}
                CachedLeaf::Deleted(leaf) => set.leaves_to_delete.push(leaf),
            }
        }
        for (path, hash) in cache.hash_entries() {
            // Cut-off paths are tombstoned by the data source itself.
            if let CachedHash::Present(hash) = hash {
                if metadata.contains(path) {
                    set.hashes.push(HashRecord::new(path, hash));
                }
            }
        }
        set.hashes.sort_unstable_by_key(|record| record.path);
        set.leaves_to_add.sort_unstable_by_key(|leaf| leaf.path);
        set
    }

    /// Number of records in the set.
    pub fn len(&self) -> usize {
        self.hashes.len() + self.leaves_to_add.len() + self.leaves_to_delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the set and leave it empty, keeping the shape.
    pub fn drain_into(
        &mut self,
        data_source: &dyn DataSource,
        reconnect_context: bool,
    ) -> Result<()> {
        let metadata = self.metadata;
        let set = std::mem::replace(self, Self::new(metadata));
        set.apply(data_source, reconnect_context)
    }

    /// Write the set.
    pub fn apply(self, data_source: &dyn DataSource, reconnect_context: bool) -> Result<()> {
        data_source.save_records(
            self.metadata.first_leaf_path,
            self.metadata.last_leaf_path,
            Box::new(self.hashes.into_iter()),
            Box::new(self.leaves_to_add.into_iter()),
            Box::new(self.leaves_to_delete.into_iter()),
            reconnect_context,
        )
    }
}
