//! Disk-resident data source.
//!
//! A data source directory holds four files:
//!
//! - `header.bin` - tree shape, committed leaf log length, garbage counter
//!   and the log generation in use
//! - `leaves.<generation>.log` - append-only leaf records
//! - `paths.<generation>.idx` - one 8-byte slot per path pointing into the
//!   leaf log
//! - `hashes.idx` - one 33-byte slot per path holding the node hash
//!
//! The key index (key to path and log offset) lives in memory and is rebuilt
//! from the path slots on open. The header is rewritten last on every save
//! and compaction, which makes the header rename their commit point.
//!
//! Snapshots copy the files without holding the state lock. Saves that land
//! while a snapshot copies record the slots they overwrite, and the snapshot
//! writes those bytes back over its copies.

mod header;
mod leaf_log;
mod slots;

use crate::source::shape_after_save;
use crate::{
    BackendKind, DataSource, HashSlot, RecordIter, Result, SnapshotManifest, StorageConfig,
    StorageError,
};
use bytes::Bytes;
use header::DiskHeader;
use leaf_log::LeafLog;
use parking_lot::{Mutex, RwLock};
use slots::{HashIndex, PathIndex, SlotCapture};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use vmap_types::{HashRecord, LeafRecord, MapMetadata};

const HASHES_FILE: &str = "hashes.idx";

/// Leaf log bytes buffered per write while compacting.
const COMPACT_CHUNK: usize = 1 << 20;

fn log_file(generation: u64) -> String {
    format!("leaves.{generation}.log")
}

fn paths_file(generation: u64) -> String {
    format!("paths.{generation}.idx")
}

/// Generation named by a leaf log or path index file name.
fn file_generation(name: &str) -> Option<u64> {
    let generation = name
        .strip_prefix("leaves.")
        .and_then(|rest| rest.strip_suffix(".log"))
        .or_else(|| {
            name.strip_prefix("paths.")
                .and_then(|rest| rest.strip_suffix(".idx"))
        })?;
    generation.parse().ok()
}

/// Where a key's current record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyEntry {
    path: u64,
    offset: u64,
    len: u32,
}

#[derive(Debug)]
struct DiskState {
    header: DiskHeader,
    keys: HashMap<Bytes, KeyEntry>,
    log: Arc<LeafLog>,
    paths: PathIndex,
    hashes: HashIndex,
}

/// The next log generation, written in full but not yet committed.
struct Compaction {
    header: DiskHeader,
    log: LeafLog,
    paths: PathIndex,
    keys: HashMap<Bytes, KeyEntry>,
}

/// What a snapshot copies, taken under a brief read lock.
struct SnapshotPoint {
    header: DiskHeader,
    log: Arc<LeafLog>,
    paths_len: u64,
    hashes_len: u64,
    leaves: usize,
}

/// Data source backed by files in one directory.
#[derive(Debug)]
pub struct DiskDataSource {
    directory: PathBuf,
    config: StorageConfig,
    state: RwLock<DiskState>,
    /// Present while a snapshot copies the index files.
    capture: Mutex<Option<SlotCapture>>,
    /// Serializes snapshots and compactions.
    maintenance: Mutex<()>,
    closed: AtomicBool,
}

impl DiskDataSource {
    /// Open the data source in `directory`, creating an empty one if the
    /// directory holds none.
    pub fn open(directory: &Path, config: StorageConfig) -> Result<Self> {
        let start = Instant::now();
        fs::create_dir_all(directory)?;

        let existing = DiskHeader::read(directory)?;
        let fresh = existing.is_none();
        let header = existing.unwrap_or_else(DiskHeader::new);
        let generation = header.log_generation;
        remove_other_generations(directory, generation)?;
        let log = LeafLog::open(&directory.join(log_file(generation)), config.max_record_size)?;
        let paths = PathIndex::open(&directory.join(paths_file(generation)))?;
        let hashes = HashIndex::open(&directory.join(HASHES_FILE))?;
        if fresh {
            header.write(directory, config.sync_writes)?;
        }

        let mut state = DiskState {
            header,
            keys: HashMap::new(),
            log: Arc::new(log),
            paths,
            hashes,
        };
        state.rebuild_key_index()?;

        info!(
            dir = %directory.display(),
            leaves = state.keys.len(),
            log_bytes = state.header.leaf_log_len,
            generation,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Opened disk data source"
        );

        Ok(Self {
            directory: directory.to_path_buf(),
            config,
            state: RwLock::new(state),
            capture: Mutex::new(None),
            maintenance: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding the files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Committed leaf log length and the part of it that is garbage.
    pub fn log_usage(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.header.leaf_log_len, state.header.garbage_bytes)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn sync_all(&self, state: &DiskState) -> Result<()> {
        if self.config.sync_writes {
            state.log.sync()?;
            state.paths.sync()?;
            state.hashes.sync()?;
        }
        Ok(())
    }

    /// Pin the committed state and start recording overwritten slots.
    fn begin_snapshot(&self) -> Result<SnapshotPoint> {
        let state = self.state.read();
        let point = SnapshotPoint {
            header: state.header.clone(),
            log: Arc::clone(&state.log),
            paths_len: state.paths.len()?,
            hashes_len: state.hashes.len()?,
            leaves: state.keys.len(),
        };
        *self.capture.lock() = Some(SlotCapture::default());
        Ok(point)
    }

    /// Copy the files as of `point` into `directory`. Runs without the
    /// state lock.
    fn write_snapshot(&self, point: &SnapshotPoint, directory: &Path) -> Result<()> {
        let generation = point.header.log_generation;
        let paths = directory.join(paths_file(generation));
        let hashes = directory.join(HASHES_FILE);
        let copied = fs::copy(self.directory.join(paths_file(generation)), &paths)
            .and_then(|_| fs::copy(self.directory.join(HASHES_FILE), &hashes));
        let capture = self.capture.lock().take().unwrap_or_default();
        copied?;
        capture.restore((&paths, point.paths_len), (&hashes, point.hashes_len))?;

        point
            .log
            .copy_prefix(&directory.join(log_file(generation)), point.header.leaf_log_len)?;
        point.header.write(directory, self.config.sync_writes)?;
        SnapshotManifest::new(BackendKind::Disk, &point.header.metadata).write(directory)?;
        Ok(())
    }

    /// Write the live records into the next log generation.
    ///
    /// Nothing live is touched: the new files only take over once the
    /// returned header is written.
    fn prepare_compaction(&self, state: &DiskState) -> Result<Compaction> {
        let generation = state.header.log_generation + 1;
        let log = LeafLog::create(
            &self.directory.join(log_file(generation)),
            self.config.max_record_size,
        )?;
        let paths = PathIndex::create(&self.directory.join(paths_file(generation)))?;

        let mut live: Vec<(&Bytes, &KeyEntry)> = state.keys.iter().collect();
        live.sort_unstable_by_key(|(_, entry)| entry.offset);

        let mut keys = HashMap::with_capacity(live.len());
        let mut slot_updates = Vec::with_capacity(live.len());
        let mut buf = Vec::with_capacity(COMPACT_CHUNK);
        let mut written = 0u64;
        for (key, entry) in live {
            let bytes = state.log.read_entry(entry.offset)?;
            let offset = written + buf.len() as u64;
            buf.extend_from_slice(&bytes);
            keys.insert(key.clone(), KeyEntry { offset, ..*entry });
            slot_updates.push((entry.path, Some(offset)));
            if buf.len() >= COMPACT_CHUNK {
                log.write_at(written, &buf)?;
                written += buf.len() as u64;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            log.write_at(written, &buf)?;
            written += buf.len() as u64;
        }
        paths.set_many(slot_updates.into_iter())?;
        if self.config.sync_writes {
            log.sync()?;
            paths.sync()?;
        }

        let mut header = state.header.clone();
        header.log_generation = generation;
        header.leaf_log_len = written;
        header.garbage_bytes = 0;
        Ok(Compaction {
            header,
            log,
            paths,
            keys,
        })
    }

    fn remove_generation(&self, generation: u64) {
        remove_logged(&self.directory.join(log_file(generation)));
        remove_logged(&self.directory.join(paths_file(generation)));
    }
}

/// Remove leaf logs and path indexes of generations other than `keep`,
/// left behind by a compaction that was interrupted.
fn remove_other_generations(directory: &Path, keep: u64) -> Result<()> {
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(generation) = name.to_str().and_then(file_generation) else {
            continue;
        };
        if generation != keep {
            warn!(
                file = %entry.path().display(),
                generation,
                current = keep,
                "Removing file of an abandoned log generation"
            );
            remove_logged(&entry.path());
        }
    }
    Ok(())
}

fn remove_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove file"),
    }
}

impl DiskState {
    fn rebuild_key_index(&mut self) -> Result<()> {
        self.keys.clear();
        let metadata = self.header.metadata;
        if metadata.is_empty() {
            return Ok(());
        }
        for path in metadata.first_leaf_path..=metadata.last_leaf_path {
            let Some(offset) = self.paths.get(path)? else {
                return Err(StorageError::Corrupt(format!("leaf path {path} has no record")));
            };
            if offset >= self.header.leaf_log_len {
                return Err(StorageError::Corrupt(format!(
                    "leaf path {path} points past the committed log ({offset})"
                )));
            }
            let (leaf, len) = self.log.read(offset)?;
            if leaf.path != path {
                return Err(StorageError::Corrupt(format!(
                    "record at path {path} claims path {}",
                    leaf.path
                )));
            }
            self.keys.insert(leaf.key, KeyEntry { path, offset, len });
        }
        Ok(())
    }

    fn leaf_at(&self, path: u64) -> Result<Option<LeafRecord>> {
        let Some(offset) = self.paths.get(path)? else {
            return Ok(None);
        };
        let (leaf, _) = self.log.read(offset)?;
        // The slot may point at a record that has since been replaced.
        match self.keys.get(&leaf.key) {
            Some(entry) if entry.offset == offset && entry.path == path => Ok(Some(leaf)),
            _ => Ok(None),
        }
    }

    /// Forget `key`, clearing its path slot if the slot still points at it.
    fn forget(&mut self, key: &[u8], slot_updates: &mut Vec<(u64, Option<u64>)>) -> Result<()> {
        let Some(entry) = self.keys.remove(key) else {
            return Ok(());
        };
        self.header.garbage_bytes += entry.len as u64;
        if self.paths.get(entry.path)? == Some(entry.offset) {
            slot_updates.push((entry.path, None));
        }
        Ok(())
    }

    fn install(&mut self, compaction: Compaction) {
        self.header = compaction.header;
        self.log = Arc::new(compaction.log);
        self.paths = compaction.paths;
        self.keys = compaction.keys;
    }
}

impl DataSource for DiskDataSource {
    fn metadata(&self) -> Result<MapMetadata> {
        self.ensure_open()?;
        Ok(self.state.read().header.metadata)
    }

    fn load_leaf_by_key(&self, key: &[u8]) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        let state = self.state.read();
        let Some(entry) = state.keys.get(key) else {
            return Ok(None);
        };
        let (leaf, _) = state.log.read(entry.offset)?;
        Ok(Some(leaf))
    }

    fn load_leaf_by_path(&self, path: u64) -> Result<Option<LeafRecord>> {
        self.ensure_open()?;
        let state = self.state.read();
        if !state.header.metadata.is_leaf(path) {
            return Ok(None);
        }
        state.leaf_at(path)
    }

    fn load_hash_slot(&self, path: u64) -> Result<HashSlot> {
        self.ensure_open()?;
        Ok(self.state.read().hashes.get(path)?)
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
        let start = Instant::now();
        let mut state = self.state.write();
        let mut capture = self.capture.lock();

        // Encode additions first so an oversized record fails the save
        // before anything is written.
        let mut appended = Vec::new();
        let mut added = Vec::new();
        for leaf in leaves_to_add {
            let offset = state.header.leaf_log_len + appended.len() as u64;
            let len = state.log.encode_into(&leaf, &mut appended)?;
            let entry = KeyEntry {
                path: leaf.path,
                offset,
                len,
            };
            added.push((leaf.key, entry));
        }

        let hash_records: Vec<HashRecord> = hashes.collect();
        if let Some(capture) = capture.as_mut() {
            for record in &hash_records {
                capture.hashes_before(&state.hashes, record.path, record.path)?;
            }
        }
        state
            .hashes
            .put_many(hash_records.iter().map(|r| (r.path, r.hash)))?;

        let mut slot_updates: Vec<(u64, Option<u64>)> = Vec::new();
        let mut deleted = 0usize;
        for leaf in leaves_to_delete {
            let stored_path = state.keys.get(&leaf.key).map(|entry| entry.path);
            match stored_path {
                Some(path) if reconnect_context && path != leaf.path => {}
                Some(_) => {
                    state.forget(&leaf.key, &mut slot_updates)?;
                    deleted += 1;
                }
                None => {}
            }
        }

        if !appended.is_empty() {
            state.log.write_at(state.header.leaf_log_len, &appended)?;
            state.header.leaf_log_len += appended.len() as u64;
        }
        let added_count = added.len();
        for (key, entry) in added {
            if let Some(old) = state.keys.insert(key, entry) {
                state.header.garbage_bytes += old.len as u64;
            }
            slot_updates.push((entry.path, Some(entry.offset)));
        }
        if let Some(capture) = capture.as_mut() {
            for (path, _) in &slot_updates {
                capture.paths_before(&state.paths, *path, *path)?;
            }
        }
        state.paths.set_many(slot_updates.into_iter())?;

        let (next, stale) =
            shape_after_save(&state.header.metadata, first_leaf_path, last_leaf_path);
        if !stale.is_empty() {
            // Drop records still parked on cut-off paths.
            for path in stale.clone() {
                if let Some(leaf) = state.leaf_at(path)? {
                    if let Some(entry) = state.keys.remove(&leaf.key) {
                        state.header.garbage_bytes += entry.len as u64;
                    }
                }
            }
            if let Some(capture) = capture.as_mut() {
                capture.hashes_before(&state.hashes, *stale.start(), *stale.end())?;
                capture.paths_before(&state.paths, *stale.start(), *stale.end())?;
            }
            state.hashes.delete_range(*stale.start(), *stale.end())?;
            state.paths.clear_range(*stale.start(), *stale.end())?;
        }
        state.header.metadata = next;

        self.sync_all(&state)?;
        state.header.write(&self.directory, self.config.sync_writes)?;

        debug!(
            hashes = hash_records.len(),
            added = added_count,
            deleted,
            stale = ?stale,
            size = next.size,
            reconnect_context,
            capturing = capture.is_some(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Saved records to disk data source"
        );
        Ok(())
    }

    fn snapshot(&self, directory: &Path) -> Result<()> {
        self.ensure_open()?;
        if directory == self.directory {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                "snapshot directory is the live data directory",
            )));
        }
        fs::create_dir_all(directory)?;
        let start = Instant::now();

        let _maintenance = self.maintenance.lock();
        let point = self.begin_snapshot()?;
        self.write_snapshot(&point, directory)?;

        info!(
            from = %self.directory.display(),
            to = %directory.display(),
            leaves = point.leaves,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Wrote disk snapshot"
        );
        Ok(())
    }

    fn fork(&self, directory: &Path) -> Result<Arc<dyn DataSource>> {
        self.snapshot(directory)?;
        Ok(Arc::new(Self::open(directory, self.config.clone())?))
    }

    fn compact(&self) -> Result<()> {
        self.ensure_open()?;
        let start = Instant::now();
        let _maintenance = self.maintenance.lock();
        let mut state = self.state.write();
        let retired = state.header.log_generation;
        let before = state.header.leaf_log_len;

        let prepared = self.prepare_compaction(&state).and_then(|compaction| {
            compaction
                .header
                .write(&self.directory, self.config.sync_writes)?;
            Ok(compaction)
        });
        let compaction = match prepared {
            Ok(compaction) => compaction,
            Err(e) => {
                warn!(dir = %self.directory.display(), error = %e, "Compaction failed");
                self.remove_generation(retired + 1);
                return Err(e);
            }
        };
        state.install(compaction);
        self.remove_generation(retired);

        info!(
            dir = %self.directory.display(),
            before,
            after = state.header.leaf_log_len,
            generation = state.header.log_generation,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Compacted leaf log"
        );
        Ok(())
    }

    fn needs_compaction(&self) -> bool {
        let state = self.state.read();
        state.header.garbage_ratio() > self.config.compaction_garbage_ratio
    }

    fn close(&self, keep_data: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Wait out any in-flight writer.
        let state = self.state.write();
        if keep_data {
            self.sync_all(&state)?;
        } else if let Err(e) = fs::remove_dir_all(&self.directory) {
            warn!(dir = %self.directory.display(), error = %e, "Failed to remove data directory");
            return Err(e.into());
        }
        debug!(dir = %self.directory.display(), keep_data, "Closed disk data source");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use vmap_types::hash_internal;

    fn leaf(path: u64, key: &str, value: &str) -> LeafRecord {
        LeafRecord::new(path, key.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    fn save(ds: &dyn DataSource, size: u64, adds: Vec<LeafRecord>, deletes: Vec<LeafRecord>) {
        let shape = MapMetadata::for_size(size);
        let hashes: Vec<HashRecord> = adds.iter().map(|l| l.hash_record()).collect();
        ds.save_records(
            shape.first_leaf_path,
            shape.last_leaf_path,
            Box::new(hashes.into_iter()),
            Box::new(adds.into_iter()),
            Box::new(deletes.into_iter()),
            false,
        )
        .unwrap();
    }

    fn three_leaves(dir: &Path) -> DiskDataSource {
        let ds = DiskDataSource::open(dir, StorageConfig::unsynced()).unwrap();
        save(
            &ds,
            3,
            vec![leaf(3, "a", "1"), leaf(4, "b", "2"), leaf(2, "c", "3")],
            vec![],
        );
        ds
    }

    #[test]
    #[traced_test]
    fn test_save_load_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ds = three_leaves(dir.path());
            assert_eq!(ds.load_leaf_by_key(b"b").unwrap(), Some(leaf(4, "b", "2")));
            assert_eq!(ds.load_leaf_by_path(2).unwrap(), Some(leaf(2, "c", "3")));
            assert_eq!(ds.load_leaf_by_path(0).unwrap(), None);
            ds.close(true).unwrap();
        }

        let ds = DiskDataSource::open(dir.path(), StorageConfig::unsynced()).unwrap();
        assert!(logs_contain("Opened disk data source"));
        assert_eq!(ds.metadata().unwrap(), MapMetadata::for_size(3));
        assert_eq!(ds.load_leaf_by_key(b"a").unwrap(), Some(leaf(3, "a", "1")));
        assert_eq!(
            ds.load_hash(4).unwrap(),
            Some(leaf(4, "b", "2").hash())
        );
        assert_eq!(ds.load_hash(1).unwrap(), None);
    }

    #[test]
    fn test_delete_moves_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let ds = three_leaves(dir.path());

        // Delete "c" at 2: the last leaf "b" fills path 2, "a" rises to 1.
        let b = leaf(2, "b", "2");
        let a = leaf(1, "a", "1");
        let root = hash_internal(&a.hash(), &b.hash());
        ds.save_records(
            1,
            2,
            Box::new(
                vec![a.hash_record(), b.hash_record(), HashRecord::new(0, root)].into_iter(),
            ),
            Box::new(vec![a.clone(), b.clone()].into_iter()),
            Box::new(std::iter::once(leaf(2, "c", "3"))),
            false,
        )
        .unwrap();

        assert_eq!(ds.metadata().unwrap(), MapMetadata::for_size(2));
        assert_eq!(ds.load_leaf_by_key(b"c").unwrap(), None);
        assert_eq!(ds.load_leaf_by_path(1).unwrap(), Some(a));
        assert_eq!(ds.load_leaf_by_path(2).unwrap(), Some(b));
        assert_eq!(ds.load_hash(3).unwrap(), None);
        assert_eq!(ds.load_hash(4).unwrap(), None);
        assert_eq!(ds.load_hash(0).unwrap(), Some(root));
        assert_eq!(ds.load_hash_slot(4).unwrap(), HashSlot::Deleted);
        assert_eq!(ds.load_hash_slot(5).unwrap(), HashSlot::Unwritten);
        let (_, garbage) = ds.log_usage();
        assert!(garbage > 0);
    }

    #[test]
    fn test_compaction_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let ds = three_leaves(dir.path());
        for round in 0..5 {
            let value = format!("v{round}");
            save(&ds, 3, vec![leaf(3, "a", &value)], vec![]);
        }
        assert!(ds.needs_compaction());
        let (before, _) = ds.log_usage();

        ds.compact().unwrap();
        let (after, garbage) = ds.log_usage();
        assert!(after < before);
        assert_eq!(garbage, 0);
        assert!(!ds.needs_compaction());
        assert_eq!(ds.load_leaf_by_key(b"a").unwrap(), Some(leaf(3, "a", "v4")));
        assert_eq!(ds.load_leaf_by_path(4).unwrap(), Some(leaf(4, "b", "2")));

        assert!(dir.path().join(log_file(1)).exists());
        assert!(!dir.path().join(log_file(0)).exists());

        drop(ds);
        let reopened = DiskDataSource::open(dir.path(), StorageConfig::unsynced()).unwrap();
        assert_eq!(
            reopened.load_leaf_by_path(3).unwrap(),
            Some(leaf(3, "a", "v4"))
        );
    }

    /// Three leaves plus five overwrites of "a".
    fn with_garbage(dir: &Path) -> DiskDataSource {
        let ds = three_leaves(dir);
        for round in 0..5 {
            save(&ds, 3, vec![leaf(3, "a", &format!("v{round}"))], vec![]);
        }
        ds
    }

    fn assert_final_contents(ds: &DiskDataSource) {
        assert_eq!(ds.load_leaf_by_key(b"a").unwrap(), Some(leaf(3, "a", "v4")));
        assert_eq!(ds.load_leaf_by_path(4).unwrap(), Some(leaf(4, "b", "2")));
        assert_eq!(ds.load_leaf_by_path(2).unwrap(), Some(leaf(2, "c", "3")));
    }

    #[test]
    #[traced_test]
    fn test_uncommitted_compaction_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let ds = with_garbage(dir.path());
        let usage = ds.log_usage();
        {
            // The process dies after writing the next generation but before
            // the header names it.
            let state = ds.state.write();
            let _compaction = ds.prepare_compaction(&state).unwrap();
        }
        drop(ds);
        assert!(dir.path().join(log_file(1)).exists());

        let reopened = DiskDataSource::open(dir.path(), StorageConfig::unsynced()).unwrap();
        assert!(logs_contain("abandoned log generation"));
        assert_eq!(reopened.log_usage(), usage);
        assert_final_contents(&reopened);
        assert!(!dir.path().join(log_file(1)).exists());
        assert!(!dir.path().join(paths_file(1)).exists());
    }

    #[test]
    fn test_committed_compaction_survives_missing_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let ds = with_garbage(dir.path());
        let (before, _) = ds.log_usage();
        let compacted_len = {
            // The process dies after the header commit, before the old
            // generation is removed.
            let state = ds.state.write();
            let compaction = ds.prepare_compaction(&state).unwrap();
            compaction.header.write(dir.path(), false).unwrap();
            compaction.header.leaf_log_len
        };
        drop(ds);

        let reopened = DiskDataSource::open(dir.path(), StorageConfig::unsynced()).unwrap();
        assert_eq!(reopened.log_usage(), (compacted_len, 0));
        assert!(compacted_len < before);
        assert_final_contents(&reopened);
        assert!(!dir.path().join(log_file(0)).exists());
        assert!(!dir.path().join(paths_file(0)).exists());

        // Saves keep working on the new generation.
        save(&reopened, 3, vec![leaf(2, "c", "after")], vec![]);
        assert_eq!(reopened.load_leaf_by_key(b"c").unwrap(), Some(leaf(2, "c", "after")));
    }

    #[test]
    fn test_file_generation_parsing() {
        assert_eq!(file_generation(&log_file(7)), Some(7));
        assert_eq!(file_generation(&paths_file(0)), Some(0));
        assert_eq!(file_generation(HASHES_FILE), None);
        assert_eq!(file_generation("header.bin"), None);
        assert_eq!(file_generation("leaves.x.log"), None);
    }

    #[test]
    fn test_snapshot_ignores_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let snap = tempfile::tempdir().unwrap();
        let ds = three_leaves(&dir.path().join("live"));
        ds.snapshot(snap.path()).unwrap();
        save(&ds, 3, vec![leaf(2, "c", "changed")], vec![]);

        let restored = DiskDataSource::open(snap.path(), StorageConfig::unsynced()).unwrap();
        assert_eq!(restored.load_leaf_by_key(b"c").unwrap(), Some(leaf(2, "c", "3")));
        let manifest = SnapshotManifest::read(snap.path()).unwrap();
        assert_eq!(manifest.backend, BackendKind::Disk);
        assert_eq!(manifest.leaf_count, 3);
    }

    #[test]
    fn test_save_runs_while_snapshot_copies() {
        let dir = tempfile::tempdir().unwrap();
        let snap = tempfile::tempdir().unwrap();
        let ds = Arc::new(three_leaves(&dir.path().join("live")));
        let b_hash = leaf(4, "b", "2").hash();

        let point = ds.begin_snapshot().unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer = {
            let ds = Arc::clone(&ds);
            std::thread::spawn(move || {
                save(ds.as_ref(), 3, vec![leaf(2, "c", "changed")], vec![]);
                // Delete "b": the tree shrinks and paths 3 and 4 are cut off.
                let a = leaf(1, "a", "1");
                let c = leaf(2, "c", "changed");
                ds.save_records(
                    1,
                    2,
                    Box::new(vec![a.hash_record(), c.hash_record()].into_iter()),
                    Box::new(std::iter::once(a)),
                    Box::new(std::iter::once(leaf(4, "b", "2"))),
                    false,
                )
                .unwrap();
                done_tx.send(()).unwrap();
            })
        };
        done_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("save waited on the snapshot");
        writer.join().unwrap();
        ds.write_snapshot(&point, snap.path()).unwrap();

        assert_eq!(ds.metadata().unwrap(), MapMetadata::for_size(2));
        assert_eq!(ds.load_hash_slot(4).unwrap(), HashSlot::Deleted);

        let restored = DiskDataSource::open(snap.path(), StorageConfig::unsynced()).unwrap();
        assert_eq!(restored.metadata().unwrap(), MapMetadata::for_size(3));
        assert_eq!(restored.load_leaf_by_key(b"c").unwrap(), Some(leaf(2, "c", "3")));
        assert_eq!(restored.load_leaf_by_path(4).unwrap(), Some(leaf(4, "b", "2")));
        assert_eq!(restored.load_hash_slot(4).unwrap(), HashSlot::Present(b_hash));
        assert_eq!(restored.load_hash(2).unwrap(), Some(leaf(2, "c", "3").hash()));
    }

    #[test]
    fn test_snapshots_during_saves_are_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = tempfile::tempdir().unwrap();
        let ds = Arc::new(three_leaves(&dir.path().join("live")));

        let writer = {
            let ds = Arc::clone(&ds);
            std::thread::spawn(move || {
                for round in 0..200 {
                    let value = format!("r{round}");
                    save(
                        ds.as_ref(),
                        3,
                        vec![leaf(3, "a", &value), leaf(4, "b", &value), leaf(2, "c", &value)],
                        vec![],
                    );
                }
            })
        };
        let targets: Vec<PathBuf> = (0..8).map(|i| snaps.path().join(format!("s{i}"))).collect();
        for target in &targets {
            ds.snapshot(target).unwrap();
        }
        writer.join().unwrap();

        for target in &targets {
            let restored = DiskDataSource::open(target, StorageConfig::unsynced()).unwrap();
            let a = restored.load_leaf_by_key(b"a").unwrap().unwrap();
            for (key, path) in [("b", 4), ("c", 2)] {
                let other = restored.load_leaf_by_key(key.as_bytes()).unwrap().unwrap();
                assert_eq!(other.value, a.value, "{} mixes saves", target.display());
                assert_eq!(restored.load_hash(path).unwrap(), Some(other.hash()));
            }
            assert_eq!(restored.load_hash(3).unwrap(), Some(a.hash()));
        }
    }

    #[test]
    fn test_fork_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let ds = three_leaves(&dir.path().join("live"));
        let fork_dir = dir.path().join("fork");
        let fork = ds.fork(&fork_dir).unwrap();
        save(fork.as_ref(), 3, vec![leaf(3, "a", "forked")], vec![]);

        assert_eq!(ds.load_leaf_by_key(b"a").unwrap(), Some(leaf(3, "a", "1")));
        assert_eq!(
            fork.load_leaf_by_key(b"a").unwrap(),
            Some(leaf(3, "a", "forked"))
        );

        fork.close(false).unwrap();
        assert!(!fork_dir.exists());
        assert!(matches!(fork.metadata(), Err(StorageError::Closed)));
    }

    #[test]
    fn test_torn_log_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (len, _) = {
            let ds = three_leaves(dir.path());
            ds.log_usage()
        };
        {
            use std::io::Write;
            let mut log = fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join(log_file(0)))
                .unwrap();
            log.write_all(b"garbage from an interrupted save").unwrap();
        }

        let ds = DiskDataSource::open(dir.path(), StorageConfig::unsynced()).unwrap();
        assert_eq!(ds.log_usage().0, len);
        save(&ds, 3, vec![leaf(4, "b", "new")], vec![]);
        assert_eq!(ds.load_leaf_by_key(b"b").unwrap(), Some(leaf(4, "b", "new")));
    }
}
