//! One tree seen through one shape.

use vmap_engine::{Result, VirtualMap};
use vmap_types::{path, Hash, LeafRecord, MapMetadata, Path};

/// What a path is in a given shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Internal,
    Leaf,
    Absent,
}

/// Node lookups shared by both ends of a reconnect.
///
/// The teacher's view reads its own tree through its own shape. The
/// learner's view reads its *original* tree but classifies paths by the shape
/// the teacher announced, so both sides agree on which paths are leaves while
/// the learner compares against what it already has.
#[derive(Debug, Clone)]
pub struct TreeView {
    map: VirtualMap,
    shape: MapMetadata,
}

impl TreeView {
    /// View of a sealed version through its own shape.
    pub fn teacher(map: VirtualMap) -> Self {
        let shape = map.metadata();
        Self { map, shape }
    }

    /// View of the learner's original version through the target shape.
    pub fn learner(original: VirtualMap, target: MapMetadata) -> Self {
        Self {
            map: original,
            shape: target,
        }
    }

    /// The shape paths are classified by.
    pub fn shape(&self) -> MapMetadata {
        self.shape
    }

    /// The version lookups read from.
    pub fn map(&self) -> &VirtualMap {
        &self.map
    }

    pub fn kind(&self, path: Path) -> NodeKind {
        if self.shape.is_internal(path) {
            NodeKind::Internal
        } else if self.shape.is_leaf(path) {
            NodeKind::Leaf
        } else {
            NodeKind::Absent
        }
    }

    /// Children of an internal node that exist in the shape.
    pub fn children(&self, parent: Path) -> impl Iterator<Item = Path> + '_ {
        let internal = self.kind(parent) == NodeKind::Internal;
        [path::left_child(parent), path::right_child(parent)]
            .into_iter()
            .filter(move |child| internal && self.shape.contains(*child))
    }

    /// Hash stored at `path` in the underlying version, if it has that node.
    pub fn hash(&self, path: Path) -> Result<Option<Hash>> {
        self.map.hash_at(path)
    }

    /// Leaf stored at `path` in the underlying version.
    pub fn leaf(&self, path: Path) -> Result<Option<LeafRecord>> {
        self.map.leaf_at(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vmap_engine::MapConfig;
    use vmap_storage::MemoryDataSource;

    fn sealed(size: usize) -> VirtualMap {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
        let head =
            VirtualMap::new(Arc::new(MemoryDataSource::new()), MapConfig::default(), pool).unwrap();
        for i in 0..size {
            head.put(format!("k{i}"), "v").unwrap();
        }
        let sealed = head.clone();
        head.copy().unwrap();
        sealed
    }

    #[test]
    fn test_teacher_view_follows_own_shape() {
        let view = TreeView::teacher(sealed(3)); // leaves 2..=4
        assert_eq!(view.kind(0), NodeKind::Internal);
        assert_eq!(view.kind(1), NodeKind::Internal);
        assert_eq!(view.kind(2), NodeKind::Leaf);
        assert_eq!(view.kind(5), NodeKind::Absent);
        assert_eq!(view.children(0).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(view.children(1).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(view.children(2).count(), 0);
        assert!(view.leaf(3).unwrap().is_some());
    }

    #[test]
    fn test_learner_view_mixes_shapes() {
        // Old tree has one leaf at 1; the target has leaves 2..=4.
        let view = TreeView::learner(sealed(1), MapMetadata::for_size(3));
        assert_eq!(view.kind(1), NodeKind::Internal);
        assert_eq!(view.children(1).collect::<Vec<_>>(), vec![3, 4]);
        // Lookups still read the old tree.
        assert!(view.leaf(1).unwrap().is_some());
        assert_eq!(view.hash(3).unwrap(), None);
    }

    #[test]
    fn test_one_leaf_root_has_one_child() {
        let view = TreeView::teacher(sealed(1));
        assert_eq!(view.children(0).collect::<Vec<_>>(), vec![1]);
        let empty = TreeView::teacher(sealed(0));
        assert_eq!(empty.children(0).count(), 0);
    }
}
