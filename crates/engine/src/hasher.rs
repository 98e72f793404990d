//! Bottom-up hashing of sealed versions.
//!
//! Only the leaves a version wrote are hashed; their ancestors are
//! recomputed level by level, taking sibling hashes from the pending set or,
//! for untouched subtrees, from the cache chain. Everything else is reused
//! from older versions.

use crate::cache::NodeCache;
use crate::version::Version;
use crate::{MapError, Result, VirtualMap};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use vmap_storage::HashSlot;
use vmap_types::{empty_root_hash, hash_internal, path, Hash, MapMetadata, ROOT_PATH};

/// Paths of `base` that lie beyond the end of `metadata`.
pub(crate) fn cut_off_paths(base: &MapMetadata, metadata: &MapMetadata) -> RangeInclusive<u64> {
    if base.is_empty() {
        return 1..=0;
    }
    let start = if metadata.is_empty() {
        1
    } else {
        metadata.last_leaf_path + 1
    };
    start..=base.last_leaf_path
}

/// Compute and record every hash a sealed version changed. Returns the root.
///
/// Must run after the previous version has been hashed: untouched sibling
/// subtrees are read through the cache chain.
pub(crate) fn hash_version(version: &Version) -> Result<Hash> {
    let cache = &version.cache;
    let metadata = version.metadata();

    for path in cut_off_paths(&version.base, &metadata) {
        cache.delete_hash(path);
    }

    if metadata.is_empty() {
        let root = empty_root_hash();
        cache.put_hash(ROOT_PATH, root);
        return Ok(root);
    }

    let dirty = cache.dirty_leaves(&metadata);
    if dirty.is_empty() && metadata == version.base {
        if let Some(root) = cache.lookup_hash(ROOT_PATH)? {
            return Ok(root);
        }
    }

    let leaf_hashes: Vec<(u64, Hash)> = dirty
        .par_iter()
        .map(|leaf| (leaf.path, leaf.hash()))
        .collect();

    let mut pending: BTreeMap<u64, Hash> = BTreeMap::new();
    for (path, hash) in leaf_hashes {
        cache.put_hash(path, hash);
        pending.insert(path, hash);
    }

    while let Some((path, hash)) = pending.pop_last() {
        if path == ROOT_PATH {
            return Ok(hash);
        }
        let sibling = path::sibling(path);
        let sibling_hash = match pending.remove(&sibling) {
            Some(hash) => hash,
            None => node_hash(cache, &metadata, sibling, version.generation)?,
        };
        let parent_hash = if path::is_left(path) {
            hash_internal(&hash, &sibling_hash)
        } else {
            hash_internal(&sibling_hash, &hash)
        };
        let parent = path::parent(path);
        cache.put_hash(parent, parent_hash);
        pending.insert(parent, parent_hash);
    }

    // The shape changed without touching any leaf below the root.
    let root = hash_internal(
        &node_hash(cache, &metadata, path::left_child(ROOT_PATH), version.generation)?,
        &node_hash(cache, &metadata, path::right_child(ROOT_PATH), version.generation)?,
    );
    cache.put_hash(ROOT_PATH, root);
    Ok(root)
}

/// Current hash of a node that is not being recomputed.
fn node_hash(cache: &NodeCache, metadata: &MapMetadata, path: u64, generation: u64) -> Result<Hash> {
    if !metadata.contains(path) {
        return Ok(Hash::ZERO);
    }
    match cache.lookup_hash_slot(path)? {
        HashSlot::Present(hash) => Ok(hash),
        HashSlot::Deleted => Err(MapError::Hashing(format!(
            "version {generation} reads a tombstoned hash at path {path} inside its tree"
        ))),
        HashSlot::Unwritten => Err(MapError::Hashing(format!(
            "version {generation} has no hash for untouched path {path}"
        ))),
    }
}

/// Check every stored hash of a sealed version against its children.
///
/// Walks from the last leaf up to the root and returns the first path whose
/// stored hash differs from the hash recomputed from its leaf record or its
/// children's stored hashes.
pub fn verify_tree(map: &VirtualMap) -> Result<Option<u64>> {
    let metadata = map.metadata();
    if metadata.is_empty() {
        return Ok((map.hash_at(ROOT_PATH)? != Some(empty_root_hash())).then_some(ROOT_PATH));
    }

    let child_hash = |child: u64| -> Result<Hash> {
        if metadata.contains(child) {
            Ok(map.hash_at(child)?.unwrap_or(Hash::ZERO))
        } else {
            Ok(Hash::ZERO)
        }
    };

    for path in (0..=metadata.last_leaf_path).rev() {
        let expected = if metadata.is_leaf(path) {
            match map.leaf_at(path)? {
                Some(leaf) => leaf.hash(),
                None => return Ok(Some(path)),
            }
        } else {
            hash_internal(
                &child_hash(path::left_child(path))?,
                &child_hash(path::right_child(path))?,
            )
        };
        if map.hash_at(path)? != Some(expected) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
