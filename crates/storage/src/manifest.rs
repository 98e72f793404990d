//! Snapshot manifest.
//!
//! Every snapshot directory carries a small `manifest.toml` next to the
//! backend's private files. The manifest names the backend that wrote the
//! directory and the shape of the tree; the map layer adds the generation and
//! root hash of the version it snapshotted.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use vmap_types::{Hash, MapMetadata};

/// Name of the manifest file inside a snapshot directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Snapshot layout version written by this build.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Which backend wrote a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Disk,
}

/// Contents of `manifest.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format_version: u32,
    pub backend: BackendKind,

    /// Number of leaves. Leaf paths follow from it.
    pub leaf_count: u64,

    /// Map version the snapshot was taken from, when taken through a map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,

    /// Hex-encoded root hash, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,
}

impl SnapshotManifest {
    /// Manifest for a backend snapshot of a tree with the given shape.
    pub fn new(backend: BackendKind, metadata: &MapMetadata) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            backend,
            leaf_count: metadata.size,
            generation: None,
            root_hash: None,
        }
    }

    /// Record the map version and its root hash.
    pub fn with_version(mut self, generation: u64, root_hash: Hash) -> Self {
        self.generation = Some(generation);
        self.root_hash = Some(root_hash.to_hex());
        self
    }

    /// Tree shape recorded in the manifest.
    pub fn metadata(&self) -> Result<MapMetadata> {
        MapMetadata::checked_for_size(self.leaf_count).ok_or_else(|| {
            StorageError::Corrupt(format!("manifest records {} leaves", self.leaf_count))
        })
    }

    /// Decoded root hash, if recorded.
    pub fn root_hash(&self) -> Result<Option<Hash>> {
        self.root_hash
            .as_deref()
            .map(|hex| Hash::from_hex(hex).map_err(|e| StorageError::Corrupt(e.to_string())))
            .transpose()
    }

    /// Read the manifest from a snapshot directory.
    pub fn read(directory: &Path) -> Result<Self> {
        let text = fs::read_to_string(directory.join(MANIFEST_FILE))?;
        let manifest: Self =
            toml::from_str(&text).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if manifest.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedFormat {
                found: manifest.format_version,
                expected: SNAPSHOT_FORMAT_VERSION,
            });
        }
        Ok(manifest)
    }

    /// Write the manifest into a snapshot directory.
    pub fn write(&self, directory: &Path) -> Result<()> {
        let text =
            toml::to_string(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let tmp = directory.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, text)?;
        fs::rename(tmp, directory.join(MANIFEST_FILE))?;
        Ok(())
    }
}
