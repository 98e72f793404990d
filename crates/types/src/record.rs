//! Tree content records.

use crate::{hash_leaf, Hash, Path};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A key/value pair and the path it currently occupies.
///
/// The key is immutable once written; the path changes as the tree
/// rebalances (a deletion moves the last leaf into the vacated slot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRecord {
    /// Current position in the tree.
    pub path: Path,

    /// Caller-supplied key, unique within a map.
    pub key: Bytes,

    /// Caller-supplied value.
    pub value: Bytes,
}

impl LeafRecord {
    /// Create a new leaf record.
    pub fn new(path: Path, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            path,
            key: key.into(),
            value: value.into(),
        }
    }

    /// The same record relocated to `path`.
    pub fn with_path(&self, path: Path) -> Self {
        Self {
            path,
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }

    /// The same record with a replaced value.
    pub fn with_value(&self, value: impl Into<Bytes>) -> Self {
        Self {
            path: self.path,
            key: self.key.clone(),
            value: value.into(),
        }
    }

    /// Leaf hash of this record. Independent of the path.
    pub fn hash(&self) -> Hash {
        hash_leaf(&self.key, &self.value)
    }

    /// Hash record for this leaf's current path.
    pub fn hash_record(&self) -> HashRecord {
        HashRecord::new(self.path, self.hash())
    }
}

/// The hash of a node (leaf or internal) at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    /// Node position.
    pub path: Path,

    /// Node hash.
    pub hash: Hash,
}

impl HashRecord {
    /// Create a new hash record.
    pub fn new(path: Path, hash: Hash) -> Self {
        Self { path, hash }
    }
}
