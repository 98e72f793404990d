//! Per-version node cache.
//!
//! Each map version owns a [`NodeCache`] holding the leaves and hashes it
//! changed. Lookups check the cache first, then fall through to the cache of
//! the previous version and finally to the data source. Tombstones stop the
//! fall-through: a key deleted in this version is "not found" even if an
//! older version or the data source still holds it.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use vmap_storage::{DataSource, HashSlot, Result};
use vmap_types::{Hash, LeafRecord, MapMetadata};

/// A key's state in one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CachedLeaf {
    Live(LeafRecord),
    /// Deleted in this version. Keeps the record as it was when deleted.
    Deleted(LeafRecord),
}

/// A path's hash in one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CachedHash {
    Present(Hash),
    /// The path was cut off when the tree shrank.
    Deleted,
}

/// Overlay of one version's changes on top of its predecessors.
///
/// A cache is written only while its version is the head (leaves) or while
/// the hasher processes it (hashes). The pipeline may later fold it into the
/// next version's cache with [`NodeCache::merge_into`], which rewires that
/// cache's fall-through link. Lookups hold the link's read lock while they
/// check the local maps, so a concurrent merge is never observed half done.
pub struct NodeCache {
    generation: u64,
    leaves_by_key: DashMap<Bytes, CachedLeaf>,
    /// `None` marks a path that no longer holds a leaf in this version.
    leaves_by_path: DashMap<u64, Option<LeafRecord>>,
    hashes: DashMap<u64, CachedHash>,
    previous: RwLock<Option<Arc<NodeCache>>>,
    data_source: Arc<dyn DataSource>,
}

impl fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCache")
            .field("generation", &self.generation)
            .field("leaves", &self.leaves_by_key.len())
            .field("paths", &self.leaves_by_path.len())
            .field("hashes", &self.hashes.len())
            .finish()
    }
}

impl NodeCache {
    /// Create an empty cache chained to `previous`, or directly to the data
    /// source when `previous` is `None`.
    pub fn new(
        generation: u64,
        data_source: Arc<dyn DataSource>,
        previous: Option<Arc<NodeCache>>,
    ) -> Self {
        Self {
            generation,
            leaves_by_key: DashMap::new(),
            leaves_by_path: DashMap::new(),
            hashes: DashMap::new(),
            previous: RwLock::new(previous),
            data_source,
        }
    }

    /// Generation of the version owning this cache.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of entries held, used by the flush policy.
    pub fn len(&self) -> usize {
        self.leaves_by_key.len() + self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a leaf at its current path.
    pub fn put_leaf(&self, leaf: LeafRecord) {
        self.leaves_by_path.insert(leaf.path, Some(leaf.clone()));
        self.leaves_by_key
            .insert(leaf.key.clone(), CachedLeaf::Live(leaf));
    }

    /// Record the deletion of a key. Does not touch any path.
    pub fn delete_leaf(&self, leaf: LeafRecord) {
        self.leaves_by_key
            .insert(leaf.key.clone(), CachedLeaf::Deleted(leaf));
    }

    /// Record that `path` no longer holds a leaf.
    pub fn clear_path(&self, path: u64) {
        self.leaves_by_path.insert(path, None);
    }

    pub fn put_hash(&self, path: u64, hash: Hash) {
        self.hashes.insert(path, CachedHash::Present(hash));
    }

    pub fn delete_hash(&self, path: u64) {
        self.hashes.insert(path, CachedHash::Deleted);
    }

    /// Look up a live leaf by key through the chain.
    pub fn lookup_leaf_by_key(&self, key: &[u8]) -> Result<Option<LeafRecord>> {
        let previous = self.previous.read();
        let local = self.leaves_by_key.get(key).map(|entry| entry.value().clone());
        match local {
            Some(CachedLeaf::Live(leaf)) => Ok(Some(leaf)),
            Some(CachedLeaf::Deleted(_)) => Ok(None),
            None => match previous.as_ref() {
                Some(prev) => prev.lookup_leaf_by_key(key),
                None => self.data_source.load_leaf_by_key(key),
            },
        }
    }

    /// Look up the leaf at `path` through the chain.
    ///
    /// The caller is responsible for only asking about leaf paths of the
    /// version it reads.
    pub fn lookup_leaf_by_path(&self, path: u64) -> Result<Option<LeafRecord>> {
        let previous = self.previous.read();
        let local = self.leaves_by_path.get(&path).map(|entry| entry.value().clone());
        match local {
            Some(leaf) => Ok(leaf),
            None => match previous.as_ref() {
                Some(prev) => prev.lookup_leaf_by_path(path),
                None => self.data_source.load_leaf_by_path(path),
            },
        }
    }

    /// Look up the hash slot at `path` through the chain. A tombstone in
    /// any cache stops the walk with [`HashSlot::Deleted`].
    pub fn lookup_hash_slot(&self, path: u64) -> Result<HashSlot> {
        let previous = self.previous.read();
        let local = self.hashes.get(&path).map(|entry| *entry.value());
        match local {
            Some(CachedHash::Present(hash)) => Ok(HashSlot::Present(hash)),
            Some(CachedHash::Deleted) => Ok(HashSlot::Deleted),
            None => match previous.as_ref() {
                Some(prev) => prev.lookup_hash_slot(path),
                None => self.data_source.load_hash_slot(path),
            },
        }
    }

    /// Look up the hash at `path` through the chain. Tombstoned and
    /// unwritten paths resolve to `None`.
    pub fn lookup_hash(&self, path: u64) -> Result<Option<Hash>> {
        Ok(self.lookup_hash_slot(path)?.hash())
    }

    /// Leaves this version wrote that are still leaves of `metadata`.
    pub(crate) fn dirty_leaves(&self, metadata: &MapMetadata) -> Vec<LeafRecord> {
        self.leaves_by_path
            .iter()
            .filter_map(|entry| match entry.value() {
                Some(leaf) if metadata.is_leaf(*entry.key()) => Some(leaf.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every key entry, live or deleted.
    pub(crate) fn key_entries(&self) -> Vec<CachedLeaf> {
        self.leaves_by_key
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every hash entry.
    pub(crate) fn hash_entries(&self) -> Vec<(u64, CachedHash)> {
        self.hashes
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// The cache lookups fall through to, if any.
    pub fn previous(&self) -> Option<Arc<NodeCache>> {
        self.previous.read().clone()
    }

    /// Point lookups straight at the data source.
    ///
    /// Called once this cache's predecessor has been written to the data
    /// source and dropped from the chain.
    pub fn detach(&self) {
        *self.previous.write() = None;
    }

    /// Fold this cache into `next`, the cache of the following version.
    ///
    /// Entries `next` already has win. Afterwards `next` falls through to
    /// whatever this cache fell through to, so this cache can be dropped.
    pub fn merge_into(&self, next: &NodeCache) {
        let mut link = next.previous.write();
        for entry in self.leaves_by_key.iter() {
            next.leaves_by_key
                .entry(entry.key().clone())
                .or_insert_with(|| entry.value().clone());
        }
        for entry in self.leaves_by_path.iter() {
            next.leaves_by_path
                .entry(*entry.key())
                .or_insert_with(|| entry.value().clone());
        }
        for entry in self.hashes.iter() {
            next.hashes.entry(*entry.key()).or_insert(*entry.value());
        }
        *link = self.previous.read().clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmap_storage::MemoryDataSource;

    fn leaf(path: u64, key: &str, value: &str) -> LeafRecord {
        LeafRecord::new(path, key.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    fn data_source_with(leaves: Vec<LeafRecord>) -> Arc<dyn DataSource> {
        let ds = MemoryDataSource::new();
        let shape = MapMetadata::for_size(leaves.len() as u64);
        let hashes: Vec<_> = leaves.iter().map(|l| l.hash_record()).collect();
        ds.save_records(
            shape.first_leaf_path,
            shape.last_leaf_path,
            Box::new(hashes.into_iter()),
            Box::new(leaves.into_iter()),
            Box::new(std::iter::empty()),
            false,
        )
        .unwrap();
        Arc::new(ds)
    }

    #[test]
    fn test_falls_through_to_data_source() {
        let ds = data_source_with(vec![leaf(1, "a", "1"), leaf(2, "b", "2")]);
        let cache = NodeCache::new(0, ds, None);
        assert_eq!(cache.lookup_leaf_by_key(b"a").unwrap(), Some(leaf(1, "a", "1")));
        assert_eq!(cache.lookup_leaf_by_path(2).unwrap(), Some(leaf(2, "b", "2")));
        assert_eq!(
            cache.lookup_hash(1).unwrap(),
            Some(leaf(1, "a", "1").hash())
        );
    }

    #[test]
    fn test_tombstones_short_circuit() {
        let ds = data_source_with(vec![leaf(1, "a", "1"), leaf(2, "b", "2")]);
        let older = Arc::new(NodeCache::new(0, ds.clone(), None));
        let newer = NodeCache::new(1, ds, Some(older.clone()));

        newer.delete_leaf(leaf(2, "b", "2"));
        newer.clear_path(2);
        newer.delete_hash(2);

        assert_eq!(newer.lookup_leaf_by_key(b"b").unwrap(), None);
        assert_eq!(newer.lookup_leaf_by_path(2).unwrap(), None);
        assert_eq!(newer.lookup_hash(2).unwrap(), None);
        assert_eq!(newer.lookup_hash_slot(2).unwrap(), HashSlot::Deleted);
        assert_eq!(newer.lookup_hash_slot(7).unwrap(), HashSlot::Unwritten);
        // The older version still sees it.
        assert_eq!(older.lookup_leaf_by_key(b"b").unwrap(), Some(leaf(2, "b", "2")));
        assert!(older.lookup_hash(2).unwrap().is_some());
    }

    #[test]
    fn test_writes_never_reach_the_previous_cache() {
        let ds = data_source_with(vec![]);
        let older = Arc::new(NodeCache::new(0, ds.clone(), None));
        older.put_leaf(leaf(1, "a", "old"));
        let newer = NodeCache::new(1, ds, Some(older.clone()));
        newer.put_leaf(leaf(1, "a", "new"));

        assert_eq!(older.lookup_leaf_by_key(b"a").unwrap(), Some(leaf(1, "a", "old")));
        assert_eq!(newer.lookup_leaf_by_key(b"a").unwrap(), Some(leaf(1, "a", "new")));
    }

    #[test]
    fn test_merge_keeps_newer_entries_and_relinks() {
        let ds = data_source_with(vec![]);
        let oldest = Arc::new(NodeCache::new(0, ds.clone(), None));
        let middle = Arc::new(NodeCache::new(1, ds.clone(), Some(oldest.clone())));
        let newest = NodeCache::new(2, ds, Some(middle.clone()));

        middle.put_leaf(leaf(1, "a", "middle"));
        middle.put_leaf(leaf(2, "b", "middle"));
        middle.put_hash(0, Hash::from_bytes(b"middle root"));
        newest.put_leaf(leaf(1, "a", "newest"));
        newest.put_hash(0, Hash::from_bytes(b"newest root"));

        middle.merge_into(&newest);

        assert!(Arc::ptr_eq(&newest.previous().unwrap(), &oldest));
        assert_eq!(newest.lookup_leaf_by_key(b"a").unwrap(), Some(leaf(1, "a", "newest")));
        assert_eq!(newest.lookup_leaf_by_key(b"b").unwrap(), Some(leaf(2, "b", "middle")));
        assert_eq!(newest.lookup_hash(0).unwrap(), Some(Hash::from_bytes(b"newest root")));
    }

    #[test]
    fn test_dirty_leaves_ignore_cleared_and_internal_paths() {
        let ds = data_source_with(vec![]);
        let cache = NodeCache::new(0, ds, None);
        cache.put_leaf(leaf(1, "a", "1"));
        cache.put_leaf(leaf(3, "b", "2"));
        cache.put_leaf(leaf(4, "c", "3"));
        cache.clear_path(1);

        let mut dirty: Vec<u64> = cache
            .dirty_leaves(&MapMetadata::for_size(3))
            .iter()
            .map(|l| l.path)
            .collect();
        dirty.sort_unstable();
        assert_eq!(dirty, vec![3, 4]);
    }
}
