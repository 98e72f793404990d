//! Deletion of learner leaves the teacher's tree no longer holds.

use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use vmap_engine::{Result, VirtualMap};
use vmap_types::{LeafRecord, MapMetadata, Path};

/// Decides which leaves of the learner's original tree must be deleted.
///
/// Every key is tracked with the path it was last associated with during the
/// session: the path a received leaf put it at, or the original path at which
/// its deletion was proposed. A proposed deletion goes through only if the
/// key is still tracked at the proposed path, so a key the teacher moved to
/// another path survives no matter in which order the two paths are visited.
#[derive(Debug)]
pub struct ReconnectNodeRemover {
    original: VirtualMap,
    tracked: HashMap<Bytes, Path>,
    proposed: Vec<LeafRecord>,
    removed: u64,
}

impl ReconnectNodeRemover {
    /// Remover for the learner's sealed original version.
    pub fn new(original: VirtualMap) -> Self {
        Self {
            original,
            tracked: HashMap::new(),
            proposed: Vec::new(),
            removed: 0,
        }
    }

    /// Record a leaf the learner accepted from the teacher.
    ///
    /// Whatever different key the original tree had at the same path becomes
    /// a deletion candidate.
    pub fn leaf_received(&mut self, leaf: &LeafRecord) -> Result<()> {
        self.tracked.insert(leaf.key.clone(), leaf.path);
        if let Some(old) = self.original.leaf_at(leaf.path)? {
            if old.key != leaf.key {
                self.propose(old);
            }
        }
        Ok(())
    }

    /// Propose every original leaf whose path is not a leaf of `target`.
    ///
    /// Called once all leaves have been received.
    pub fn all_received(&mut self, target: &MapMetadata) -> Result<()> {
        let old = self.original.metadata();
        if old.is_empty() {
            return Ok(());
        }
        for path in old.first_leaf_path..=old.last_leaf_path {
            if target.is_leaf(path) {
                continue;
            }
            if let Some(leaf) = self.original.leaf_at(path)? {
                self.propose(leaf);
            }
        }
        Ok(())
    }

    fn propose(&mut self, leaf: LeafRecord) {
        // A key already received elsewhere keeps its new path.
        if let Entry::Vacant(entry) = self.tracked.entry(leaf.key.clone()) {
            entry.insert(leaf.path);
            self.proposed.push(leaf);
        }
    }

    /// Take the proposals that are still valid.
    pub fn drain_deletions(&mut self) -> Vec<LeafRecord> {
        let tracked = &self.tracked;
        let deletions: Vec<LeafRecord> = self
            .proposed
            .drain(..)
            .filter(|leaf| tracked.get(&leaf.key) == Some(&leaf.path))
            .collect();
        self.removed += deletions.len() as u64;
        deletions
    }

    /// Deletions handed out so far.
    pub fn removed(&self) -> u64 {
        self.removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vmap_engine::MapConfig;
    use vmap_storage::MemoryDataSource;

    /// Sealed version holding `keys` in insertion order.
    fn original(keys: &[&str]) -> VirtualMap {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
        let head =
            VirtualMap::new(Arc::new(MemoryDataSource::new()), MapConfig::default(), pool).unwrap();
        for key in keys {
            head.put(key.to_string(), "old").unwrap();
        }
        let sealed = head.clone();
        head.copy().unwrap();
        sealed
    }

    fn path_of(map: &VirtualMap, key: &str) -> Path {
        map.get_leaf(key.as_bytes()).unwrap().unwrap().path
    }

    fn keys(leaves: &[LeafRecord]) -> Vec<&[u8]> {
        leaves.iter().map(|leaf| leaf.key.as_ref()).collect()
    }

    #[test]
    fn test_replaced_key_is_deleted() {
        let map = original(&["a", "b", "c"]);
        let a = path_of(&map, "a");
        let mut remover = ReconnectNodeRemover::new(map);

        remover
            .leaf_received(&LeafRecord::new(a, b"x".to_vec(), b"new".to_vec()))
            .unwrap();
        let deletions = remover.drain_deletions();
        assert_eq!(keys(&deletions), vec![&b"a"[..]]);
        assert_eq!(deletions[0].path, a);
        assert_eq!(remover.removed(), 1);
    }

    #[test]
    fn test_same_key_new_value_is_kept() {
        let map = original(&["a", "b"]);
        let a = path_of(&map, "a");
        let mut remover = ReconnectNodeRemover::new(map);
        remover
            .leaf_received(&LeafRecord::new(a, b"a".to_vec(), b"new".to_vec()))
            .unwrap();
        assert!(remover.drain_deletions().is_empty());
    }

    #[test]
    fn test_moved_key_survives_in_either_order() {
        // "c" sits at the last path of the original tree.
        let map = original(&["a", "b", "c"]);
        let (a, c) = (path_of(&map, "a"), path_of(&map, "c"));
        assert!(a < c);

        // Teacher has "c" at a's old path and "z" at c's old path.
        for c_first in [true, false] {
            let mut remover = ReconnectNodeRemover::new(map.clone());
            let moved = LeafRecord::new(a, b"c".to_vec(), b"v".to_vec());
            let other = LeafRecord::new(c, b"z".to_vec(), b"v".to_vec());
            if c_first {
                remover.leaf_received(&moved).unwrap();
                remover.leaf_received(&other).unwrap();
            } else {
                remover.leaf_received(&other).unwrap();
                remover.leaf_received(&moved).unwrap();
            }
            assert_eq!(keys(&remover.drain_deletions()), vec![&b"a"[..]]);
        }
    }

    #[test]
    fn test_shrunk_tree_sweep() {
        let map = original(&["a", "b", "c", "d", "e"]);
        let e = path_of(&map, "e");
        let mut remover = ReconnectNodeRemover::new(map);

        // The teacher moved "e" to path 1.
        let target = MapMetadata::for_size(2);
        remover
            .leaf_received(&LeafRecord::new(1, b"e".to_vec(), b"v".to_vec()))
            .unwrap();
        remover.all_received(&target).unwrap();

        let mut deleted = remover.drain_deletions();
        deleted.sort_by(|x, y| x.key.cmp(&y.key));
        assert!(e > target.last_leaf_path);
        // Every original leaf lies past the target's leaf range; all go
        // except the key the teacher re-placed.
        assert_eq!(
            keys(&deleted),
            vec![&b"a"[..], &b"b"[..], &b"c"[..], &b"d"[..]]
        );
    }

    #[test]
    fn test_empty_original() {
        let mut remover = ReconnectNodeRemover::new(original(&[]));
        remover
            .leaf_received(&LeafRecord::new(1, b"a".to_vec(), b"v".to_vec()))
            .unwrap();
        remover.all_received(&MapMetadata::for_size(1)).unwrap();
        assert!(remover.drain_deletions().is_empty());
    }
}
