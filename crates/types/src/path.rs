//! Path addressing for the complete binary tree.
//!
//! Nodes are numbered breadth-first starting from the root at path 0:
//!
//! ```text
//!                 0
//!           1           2
//!        3     4     5     6
//!       7 8   9 10 11 12 13 14
//! ```
//!
//! A path carries no data of its own; parent/child/sibling relationships are
//! pure arithmetic. Whether a path is a leaf depends on the tree's current
//! `[first_leaf_path, last_leaf_path]` range (see [`crate::MapMetadata`]).

/// Index of a node in the breadth-first numbering.
pub type Path = u64;

/// The root node.
pub const ROOT_PATH: Path = 0;

/// Marker for "no such path", used for the leaf range of an empty tree.
pub const INVALID_PATH: Path = u64::MAX;

/// Parent of `path`. The root has no parent and yields [`INVALID_PATH`].
#[inline]
pub fn parent(path: Path) -> Path {
    if path == ROOT_PATH || path == INVALID_PATH {
        INVALID_PATH
    } else {
        (path - 1) / 2
    }
}

/// Left child of `path`.
#[inline]
pub fn left_child(path: Path) -> Path {
    2 * path + 1
}

/// Right child of `path`.
#[inline]
pub fn right_child(path: Path) -> Path {
    2 * path + 2
}

/// The other child of this node's parent. The root has no sibling.
#[inline]
pub fn sibling(path: Path) -> Path {
    if path == ROOT_PATH || path == INVALID_PATH {
        INVALID_PATH
    } else if is_left(path) {
        path + 1
    } else {
        path - 1
    }
}

/// Whether `path` is a left child. Left children have odd paths.
#[inline]
pub fn is_left(path: Path) -> bool {
    path & 1 == 1
}

/// Whether `path` is a right child. Right children have even, non-zero paths.
#[inline]
pub fn is_right(path: Path) -> bool {
    path != ROOT_PATH && path & 1 == 0
}

/// Depth of `path` below the root (the root has rank 0).
#[inline]
pub fn rank(path: Path) -> u32 {
    debug_assert_ne!(path, INVALID_PATH);
    63 - (path + 1).leading_zeros()
}

/// First (leftmost) path of the given rank.
#[inline]
pub fn first_path_in_rank(rank: u32) -> Path {
    (1u64 << rank) - 1
}

/// Whether `path` lies in the leaf range `[first_leaf_path, last_leaf_path]`.
#[inline]
pub fn is_leaf(path: Path, first_leaf_path: Path, last_leaf_path: Path) -> bool {
    first_leaf_path != INVALID_PATH && path >= first_leaf_path && path <= last_leaf_path
}
