//! Tree shape descriptor and the insert/delete shape transitions.

use crate::path::{self, Path, INVALID_PATH, ROOT_PATH};
use serde::{Deserialize, Serialize};

/// Authoritative tree shape for one map version.
///
/// The tree is always a full binary tree: every internal node has two
/// children except the root of a one-leaf tree. For `size >= 2` this means
/// `first_leaf_path == size - 1` and `last_leaf_path == 2 * size - 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapMetadata {
    /// Path of the first (leftmost) leaf, or [`INVALID_PATH`] when empty.
    pub first_leaf_path: Path,

    /// Path of the last (rightmost) leaf, or [`INVALID_PATH`] when empty.
    pub last_leaf_path: Path,

    /// Number of leaves.
    pub size: u64,
}

/// A leaf changing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafMove {
    pub from: Path,
    pub to: Path,
}

/// What an insert does to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertPlan {
    /// Path the new leaf goes to.
    pub path: Path,

    /// The existing leaf pushed one rank down to make room, if any.
    pub relocate: Option<LeafMove>,

    /// Shape after the insert.
    pub next: MapMetadata,
}

/// What a delete does to the tree.
///
/// The moves must be applied in order: `promote` reads whatever `fill` left
/// at its source path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePlan {
    /// The last leaf moving into the vacated path, unless the deleted leaf
    /// was the last one.
    pub fill: Option<LeafMove>,

    /// The sibling of the old last leaf moving up into their parent.
    pub promote: Option<LeafMove>,

    /// Shape after the delete.
    pub next: MapMetadata,
}

impl MapMetadata {
    /// A tree with no leaves.
    pub const EMPTY: Self = Self {
        first_leaf_path: INVALID_PATH,
        last_leaf_path: INVALID_PATH,
        size: 0,
    };

    /// Most leaves a tree can hold: the last leaf path must stay below
    /// [`INVALID_PATH`].
    pub const MAX_SIZE: u64 = 1 << 63;

    /// Shape of a tree holding `size` leaves.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`MapMetadata::MAX_SIZE`].
    pub fn for_size(size: u64) -> Self {
        assert!(size <= Self::MAX_SIZE, "tree of {size} leaves");
        match size {
            0 => Self::EMPTY,
            1 => Self {
                first_leaf_path: 1,
                last_leaf_path: 1,
                size: 1,
            },
            n => Self {
                first_leaf_path: n - 1,
                last_leaf_path: (n - 1) * 2,
                size: n,
            },
        }
    }

    /// Shape of a tree holding `size` leaves, or `None` past
    /// [`MapMetadata::MAX_SIZE`].
    pub fn checked_for_size(size: u64) -> Option<Self> {
        (size <= Self::MAX_SIZE).then(|| Self::for_size(size))
    }

    /// Shape from its leaf range, as sent over the wire.
    ///
    /// Callers should check [`MapMetadata::is_complete`] on untrusted input.
    pub fn from_leaf_paths(first_leaf_path: Path, last_leaf_path: Path) -> Self {
        let size = if first_leaf_path == INVALID_PATH || last_leaf_path < first_leaf_path {
            0
        } else {
            last_leaf_path - first_leaf_path + 1
        };
        Self {
            first_leaf_path,
            last_leaf_path,
            size,
        }
    }

    /// Whether the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `path` is a leaf in this tree.
    pub fn is_leaf(&self, path: Path) -> bool {
        path::is_leaf(path, self.first_leaf_path, self.last_leaf_path)
    }

    /// Whether `path` is an internal node. The root always is.
    pub fn is_internal(&self, path: Path) -> bool {
        path == ROOT_PATH || (!self.is_empty() && path < self.first_leaf_path)
    }

    /// Whether `path` names a node of this tree at all.
    pub fn contains(&self, path: Path) -> bool {
        path == ROOT_PATH || (!self.is_empty() && path <= self.last_leaf_path)
    }

    /// Whether the fields describe a full binary tree.
    pub fn is_complete(&self) -> bool {
        Self::checked_for_size(self.size) == Some(*self)
    }

    /// Plan the insertion of one more leaf.
    pub fn plan_insert(&self) -> InsertPlan {
        match self.size {
            // The first leaf hangs left of the root.
            0 => InsertPlan {
                path: path::left_child(ROOT_PATH),
                relocate: None,
                next: Self::for_size(1),
            },
            // The root has a free right slot.
            1 => InsertPlan {
                path: path::right_child(ROOT_PATH),
                relocate: None,
                next: Self::for_size(2),
            },
            // No free slot: the first leaf becomes a parent of two leaves.
            n => {
                let first = self.first_leaf_path;
                InsertPlan {
                    path: path::right_child(first),
                    relocate: Some(LeafMove {
                        from: first,
                        to: path::left_child(first),
                    }),
                    next: Self::for_size(n + 1),
                }
            }
        }
    }

    /// Plan the removal of the leaf at `path`.
    pub fn plan_delete(&self, path: Path) -> DeletePlan {
        debug_assert!(self.is_leaf(path), "path {path} is not a leaf of {self:?}");
        let last = self.last_leaf_path;
        let fill = (path != last).then_some(LeafMove {
            from: last,
            to: path,
        });
        match self.size {
            0 | 1 => DeletePlan {
                fill: None,
                promote: None,
                next: Self::EMPTY,
            },
            2 => DeletePlan {
                fill,
                promote: None,
                next: Self::for_size(1),
            },
            n => DeletePlan {
                fill,
                promote: Some(LeafMove {
                    from: path::sibling(last),
                    to: path::parent(last),
                }),
                next: Self::for_size(n - 1),
            },
        }
    }
}

impl Default for MapMetadata {
    fn default() -> Self {
        Self::EMPTY
    }
}
