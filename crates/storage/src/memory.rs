//! In-memory data source.

use crate::source::shape_after_save;
use crate::{
    BackendKind, DataSource, HashSlot, RecordIter, Result, SnapshotManifest, StorageConfig,
    StorageError,
};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use vmap_types::{HashRecord, LeafRecord, MapMetadata};

/// Name of the dump file inside a memory snapshot directory.
const DUMP_FILE: &str = "memory.bin";

#[derive(Debug, Clone, Default)]
struct Tables {
    metadata: MapMetadata,
    leaves: HashMap<Bytes, LeafRecord>,
    paths: HashMap<u64, Bytes>,
    /// Holds only `Present` and `Deleted` slots.
    hashes: HashMap<u64, HashSlot>,
}

/// On-disk form of a memory snapshot.
#[derive(Serialize, Deserialize)]
struct Dump {
    metadata: MapMetadata,
    leaves: Vec<LeafRecord>,
    hashes: Vec<HashRecord>,
    deleted: Vec<u64>,
}

/// Data source holding everything in hash maps.
///
/// Used by tests, by reconnect targets of small maps and as the default
/// backend of the `vmap` tool when no data directory is given.
#[derive(Debug)]
pub struct MemoryDataSource {
    tables: RwLock<Tables>,
    closed: AtomicBool,
    config: StorageConfig,
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataSource {
    /// Create an empty data source.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::unsynced())
    }

    /// Create an empty data source with an explicit config.
    pub fn with_config(config: StorageConfig) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Load a snapshot written by [`DataSource::snapshot`].
    pub fn restore(directory: &Path, config: StorageConfig) -> Result<Self> {
        let manifest = SnapshotManifest::read(directory)?;
        if manifest.backend != BackendKind::Memory {
            return Err(StorageError::Corrupt(format!(
                "snapshot at {} was written by the {:?} backend",
                directory.display(),
                manifest.backend
            )));
        }

        let reader = BufReader::new(File::open(directory.join(DUMP_FILE))?);
        let dump: Dump = bincode::deserialize_from(reader)?;
        if dump.metadata != manifest.metadata()? {
            return Err(StorageError::Corrupt(format!(
                "manifest describes {} leaves, dump holds {:?}",
                manifest.leaf_count, dump.metadata
            )));
        }

        let mut tables = Tables {
            metadata: dump.metadata,
            ..Default::default()
        };
        for leaf in dump.leaves {
            tables.paths.insert(leaf.path, leaf.key.clone());
            tables.leaves.insert(leaf.key.clone(), leaf);
        }
        tables.hashes = dump
            .hashes
            .into_iter()
            .map(|r| (r.path, HashSlot::Present(r.hash)))
            .chain(dump.deleted.into_iter().map(|path| (path, HashSlot::Deleted)))
            .collect();

        debug!(
            leaves = tables.leaves.len(),
            hashes = tables.hashes.len(),
            dir = %directory.display(),
            "Restored memory data source"
        );

        Ok(Self {
            tables: RwLock::new(tables),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Number of leaf records held.
    pub fn leaf_count(&self) -> usize {
        self.tables.read().leaves.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_size(&self, leaf: &LeafRecord) -> Result<()> {
        let size = leaf.key.len() + leaf.value.len();
        if size > self.config.max_record_size as usize {
            return Err(StorageError::RecordTooLarge {
                size,
                limit: self.config.max_record_size,
            });
        }
        Ok(())
    }
}

impl Tables {
    fn leaf_at(&self, path: u64) -> Option<&LeafRecord> {
        let key = self.paths.get(&path)?;
        // A path slot may still name a key that has since moved on.
        self.leaves.get(key).filter(|leaf| leaf.path == path)
    }

    fn remove_leaf(&mut self, leaf: &LeafRecord, reconnect_context: bool) {
        let Some(stored) = self.leaves.get(&leaf.key) else {
            return;
        };
        if reconnect_context && stored.path != leaf.path {
            return;
        }
        let stored_path = stored.path;
        self.leaves.remove(&leaf.key);
        if self.paths.get(&stored_path) == Some(&leaf.key) {
            self.paths.remove(&stored_path);
        }
    }
}

impl DataSource for MemoryDataSource {
    fn metadata(&self) -> Result<MapMetadata> {
        self.ensure_open()?;
        Ok(self.tables.read().metadata)
    }

    fn load_leaf_by_key(&self, key: &[u8]) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        Ok(self.tables.read().leaves.get(key).cloned())
    }

    fn load_leaf_by_path(&self, path: u64) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        let tables = self.tables.read();
        if !tables.metadata.is_leaf(path) {
            return Ok(None);
        }
        Ok(tables.leaf_at(path).cloned())
    }

    fn load_hash_slot(&self, path: u64) -> Result<HashSlot> {
        self.ensure_open()?;
        let tables = self.tables.read();
        Ok(tables.hashes.get(&path).copied().unwrap_or(HashSlot::Unwritten))
    }

    fn save_records(
        &self,
        first_leaf_path: u64,
        last_leaf_path: u64,
        hashes: RecordIter<'_, HashRecord>,
        leaves_to_add: RecordIter<'_, LeafRecord>,
        leaves_to_delete: RecordIter<'_, LeafRecord>,
        reconnect_context: bool,
    ) -> Result<()> {
        self.ensure_open()?;

        // Consume and validate before touching the tables so a bad record
        // leaves the previous state intact.
        let hashes: Vec<HashRecord> = hashes.collect();
        let deletes: Vec<LeafRecord> = leaves_to_delete.collect();
        let adds: Vec<LeafRecord> = leaves_to_add.collect();
        for leaf in &adds {
            self.check_size(leaf)?;
        }

        let mut tables = self.tables.write();
        let (next, stale) = shape_after_save(&tables.metadata, first_leaf_path, last_leaf_path);

        for record in &hashes {
            tables.hashes.insert(record.path, HashSlot::Present(record.hash));
        }
        for leaf in &deletes {
            tables.remove_leaf(leaf, reconnect_context);
        }
        for leaf in &adds {
            tables.paths.insert(leaf.path, leaf.key.clone());
            tables.leaves.insert(leaf.key.clone(), leaf.clone());
        }
        for path in stale.clone() {
            tables.hashes.insert(path, HashSlot::Deleted);
            if let Some(key) = tables.paths.remove(&path) {
                if tables.leaves.get(&key).is_some_and(|leaf| leaf.path == path) {
                    tables.leaves.remove(&key);
                }
            }
        }
        tables.metadata = next;

        debug!(
            hashes = hashes.len(),
            added = adds.len(),
            deleted = deletes.len(),
            stale = ?stale,
            size = next.size,
            reconnect_context,
            "Saved records to memory data source"
        );
        Ok(())
    }

    fn snapshot(&self, directory: &Path) -> Result<()> {
        self.ensure_open()?;
        fs::create_dir_all(directory)?;

        let tables = self.tables.read();
        let mut leaves: Vec<LeafRecord> = tables.leaves.values().cloned().collect();
        leaves.sort_unstable_by_key(|leaf| leaf.path);
        let mut hashes = Vec::new();
        let mut deleted = Vec::new();
        for (path, slot) in &tables.hashes {
            match slot {
                HashSlot::Present(hash) => hashes.push(HashRecord::new(*path, *hash)),
                HashSlot::Deleted => deleted.push(*path),
                HashSlot::Unwritten => {}
            }
        }
        hashes.sort_unstable_by_key(|record| record.path);
        deleted.sort_unstable();
        let dump = Dump {
            metadata: tables.metadata,
            leaves,
            hashes,
            deleted,
        };

        let mut writer = BufWriter::new(File::create(directory.join(DUMP_FILE))?);
        bincode::serialize_into(&mut writer, &dump)?;
        writer.flush()?;
        SnapshotManifest::new(BackendKind::Memory, &tables.metadata).write(directory)?;

        debug!(
            leaves = dump.leaves.len(),
            dir = %directory.display(),
            "Wrote memory snapshot"
        );
        Ok(())
    }

    fn fork(&self, _directory: &Path) -> Result<Arc<dyn DataSource>> {
        self.ensure_open()?;
        Ok(Arc::new(Self {
            tables: RwLock::new(self.tables.read().clone()),
            closed: AtomicBool::new(false),
            config: self.config.clone(),
        }))
    }

    fn close(&self, keep_data: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !keep_data {
            *self.tables.write() = Tables::default();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
