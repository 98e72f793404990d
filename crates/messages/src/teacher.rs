//! Messages sent by the teacher.

use serde::{Deserialize, Serialize};
use vmap_types::{Hash, LeafRecord, MapMetadata, Path};

/// Shape and root of the teacher's tree. Opens a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub first_leaf_path: Path,
    pub last_leaf_path: Path,
    pub root_hash: Hash,
}

impl Handshake {
    pub fn new(metadata: MapMetadata, root_hash: Hash) -> Self {
        Self {
            first_leaf_path: metadata.first_leaf_path,
            last_leaf_path: metadata.last_leaf_path,
            root_hash,
        }
    }

    /// The tree shape the learner must end up with.
    pub fn metadata(&self) -> MapMetadata {
        MapMetadata::from_leaf_paths(self.first_leaf_path, self.last_leaf_path)
    }
}

/// One round of the tree walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lessons {
    /// Nodes the learner should compare against its old tree, with the
    /// teacher's hash for each.
    pub queries: Vec<(Path, Hash)>,

    /// Leaves at paths the learner reported as mismatched.
    pub leaves: Vec<LeafRecord>,
}

impl Lessons {
    pub fn new(queries: Vec<(Path, Hash)>, leaves: Vec<LeafRecord>) -> Self {
        Self { queries, leaves }
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.leaves.is_empty()
    }
}

/// Everything the teacher sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeacherMessage {
    Handshake(Handshake),
    Lessons(Lessons),
    /// No mismatch is left; the learner's tree is complete.
    Complete,
    Abort { reason: String },
}

impl TeacherMessage {
    /// Short name for logs.
    pub fn message_type_id(&self) -> &'static str {
        match self {
            TeacherMessage::Handshake(_) => "reconnect.handshake",
            TeacherMessage::Lessons(_) => "reconnect.lessons",
            TeacherMessage::Complete => "reconnect.complete",
            TeacherMessage::Abort { .. } => "reconnect.abort",
        }
    }
}
