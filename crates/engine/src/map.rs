//! The copy-on-write map facade.

use crate::cache::NodeCache;
use crate::hasher;
use crate::pipeline::Pipeline;
use crate::version::Version;
use crate::{MapConfig, MapError, Result};
use bytes::Bytes;
use rayon::ThreadPool;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};
use vmap_storage::{open_snapshot, DataSource, SnapshotManifest, StorageConfig};
use vmap_types::{Hash, LeafRecord, MapMetadata, ROOT_PATH};

/// Releases its version when the last map handle for it goes away.
struct VersionHandle {
    version: Arc<Version>,
    pipeline: Arc<Pipeline>,
}

impl Drop for VersionHandle {
    fn drop(&mut self) {
        self.pipeline.release(&self.version);
    }
}

/// One version of a versioned, merkle-hashed key/value map.
///
/// A freshly created map is the mutable *head*. [`VirtualMap::copy`] seals
/// it and returns a new head; the sealed version keeps answering reads with
/// the state it had at the copy, while it is hashed and eventually flushed in
/// the background.
///
/// Cloning a `VirtualMap` clones the handle, not the version. The version is
/// released when its last handle is dropped.
///
/// Mutations take `&self` but the map does not serialize them: at most one
/// thread may call `put`/`delete`/`copy` on the head at a time.
///
/// # Example
///
/// ```ignore
/// let pool = Arc::new(rayon::ThreadPoolBuilder::new().build()?);
/// let head = VirtualMap::new(Arc::new(MemoryDataSource::new()), MapConfig::default(), pool)?;
/// head.put("k", "v")?;
/// let sealed = head.clone();
/// let head = head.copy()?;
/// let root = sealed.root_hash()?;
/// ```
#[derive(Clone)]
pub struct VirtualMap {
    handle: Arc<VersionHandle>,
}

impl fmt::Debug for VirtualMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self.version();
        f.debug_struct("VirtualMap")
            .field("generation", &version.generation)
            .field("sealed", &version.is_sealed())
            .field("metadata", &version.metadata())
            .finish()
    }
}

impl VirtualMap {
    /// Open a map over the current contents of `data_source`.
    pub fn new(
        data_source: Arc<dyn DataSource>,
        config: MapConfig,
        pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        Self::with_generation(data_source, config, pool, 0)
    }

    fn with_generation(
        data_source: Arc<dyn DataSource>,
        config: MapConfig,
        pool: Arc<ThreadPool>,
        generation: u64,
    ) -> Result<Self> {
        let metadata = data_source.metadata()?;
        let cache = Arc::new(NodeCache::new(generation, data_source.clone(), None));
        let version = Arc::new(Version::new(generation, cache, metadata));
        let pipeline = Pipeline::new(data_source, config, pool, version.clone());
        Ok(Self {
            handle: Arc::new(VersionHandle { version, pipeline }),
        })
    }

    /// Open a map from a directory written by [`VirtualMap::snapshot`].
    ///
    /// The data source's root hash is checked against the manifest. The head
    /// continues the generation numbering of the snapshotted version.
    pub fn restore(
        directory: &Path,
        storage: StorageConfig,
        config: MapConfig,
        pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        let manifest = SnapshotManifest::read(directory)?;
        let data_source = open_snapshot(directory, storage)?;
        let metadata = data_source.metadata()?;
        if metadata != manifest.metadata()? {
            return Err(MapError::Corrupt(format!(
                "manifest records {} leaves, data source holds {:?}",
                manifest.leaf_count, metadata
            )));
        }
        if let Some(expected) = manifest.root_hash()? {
            let stored = data_source.load_hash(ROOT_PATH)?;
            if stored != Some(expected) {
                return Err(MapError::Corrupt(format!(
                    "manifest root {expected} does not match stored root {stored:?}"
                )));
            }
        }
        let generation = manifest.generation.map_or(0, |g| g + 1);
        info!(
            dir = %directory.display(),
            generation,
            size = metadata.size,
            "Restored map"
        );
        Self::with_generation(data_source, config, pool, generation)
    }

    fn version(&self) -> &Arc<Version> {
        &self.handle.version
    }

    fn pipeline(&self) -> &Arc<Pipeline> {
        &self.handle.pipeline
    }

    /// Generation number of this version.
    pub fn generation(&self) -> u64 {
        self.version().generation
    }

    /// Whether this version is sealed (no longer the head).
    pub fn is_sealed(&self) -> bool {
        self.version().is_sealed()
    }

    /// Current tree shape of this version.
    pub fn metadata(&self) -> MapMetadata {
        self.version().metadata()
    }

    /// Number of keys.
    pub fn len(&self) -> u64 {
        self.metadata().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The data source shared by every version of this map.
    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        self.pipeline().data_source()
    }

    /// Flush policy in effect.
    pub fn config(&self) -> &MapConfig {
        self.pipeline().config()
    }

    /// Pool running background hashing and flushing.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        self.pipeline().pool()
    }

    /// Number of versions not yet retired, including this one and the head.
    pub fn retained_versions(&self) -> usize {
        self.pipeline().retained()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.get_leaf(key)?.map(|leaf| leaf.value))
    }

    /// Full leaf record stored under `key`, including its current path.
    pub fn get_leaf(&self, key: &[u8]) -> Result<Option<LeafRecord>> {
        Ok(self.version().cache.lookup_leaf_by_key(key)?)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get_leaf(key)?.is_some())
    }

    fn ensure_head(&self) -> Result<&Version> {
        let version = self.version().as_ref();
        if version.is_sealed() {
            return Err(MapError::ImmutableState {
                generation: version.generation,
            });
        }
        Ok(version)
    }

    fn ensure_sealed(&self) -> Result<&Version> {
        let version = self.version().as_ref();
        if !version.is_sealed() {
            return Err(MapError::NotSealed {
                generation: version.generation,
            });
        }
        Ok(version)
    }

    /// Insert or replace the value under `key`.
    ///
    /// A new key goes to the next free leaf slot; an existing key keeps its
    /// path.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let version = self.ensure_head()?;
        let cache = &version.cache;
        let key = key.into();
        let value = value.into();

        if let Some(existing) = cache.lookup_leaf_by_key(&key)? {
            cache.put_leaf(existing.with_value(value));
            version.record_modification();
            return Ok(());
        }

        let metadata = version.metadata();
        let plan = metadata.plan_insert();
        if let Some(moved) = plan.relocate {
            let leaf = self.required_leaf(cache, moved.from)?;
            cache.clear_path(moved.from);
            cache.put_leaf(leaf.with_path(moved.to));
        }
        cache.put_leaf(LeafRecord::new(plan.path, key, value));
        version.set_metadata(plan.next);
        version.record_modification();
        Ok(())
    }

    /// Remove `key`, returning its value.
    ///
    /// The last leaf moves into the vacated path so the tree stays full.
    pub fn delete(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let version = self.ensure_head()?;
        let cache = &version.cache;
        let Some(leaf) = cache.lookup_leaf_by_key(key)? else {
            return Ok(None);
        };

        let metadata = version.metadata();
        let plan = metadata.plan_delete(leaf.path);
        cache.clear_path(leaf.path);
        cache.delete_leaf(leaf.clone());
        for moved in [plan.fill, plan.promote].into_iter().flatten() {
            let moving = self.required_leaf(cache, moved.from)?;
            cache.clear_path(moved.from);
            cache.put_leaf(moving.with_path(moved.to));
        }
        version.set_metadata(plan.next);
        version.record_modification();
        Ok(Some(leaf.value))
    }

    fn required_leaf(&self, cache: &NodeCache, path: u64) -> Result<LeafRecord> {
        cache.lookup_leaf_by_path(path)?.ok_or_else(|| {
            MapError::Corrupt(format!(
                "version {} has no leaf at path {path}",
                self.generation()
            ))
        })
    }

    /// Seal this version and return the new mutable head.
    ///
    /// This handle stays valid as a read-only view. Hashing of the sealed
    /// version starts in the background.
    pub fn copy(&self) -> Result<VirtualMap> {
        let version = self.ensure_head()?;
        let metadata = version.metadata();
        let generation = version.generation + 1;
        let cache = Arc::new(NodeCache::new(
            generation,
            self.data_source().clone(),
            Some(version.cache.clone()),
        ));
        let next = Arc::new(Version::new(generation, cache, metadata));
        self.pipeline().seal(version, next.clone());
        Ok(VirtualMap {
            handle: Arc::new(VersionHandle {
                version: next,
                pipeline: self.pipeline().clone(),
            }),
        })
    }

    /// Root hash of this sealed version. Blocks until it is hashed.
    pub fn root_hash(&self) -> Result<Hash> {
        self.ensure_sealed()?.hashed.wait().map_err(MapError::Hashing)
    }

    /// Ask the background worker to write this version to the data source.
    ///
    /// The flush happens once every older version has been released.
    pub fn flush(&self) -> Result<()> {
        let version = self.ensure_sealed()?;
        self.pipeline().request_flush(version);
        Ok(())
    }

    /// Block until this version has been written to the data source.
    pub fn wait_until_flushed(&self) -> Result<()> {
        let version = self.ensure_sealed()?;
        version.flushed.wait().map_err(MapError::Flush)
    }

    /// Release this handle. Same as dropping it.
    pub fn release(self) {}

    /// Hash of the node at `path` in this sealed version.
    ///
    /// Waits for hashing; returns `None` for paths outside the tree.
    pub fn hash_at(&self, path: u64) -> Result<Option<Hash>> {
        let root = self.root_hash()?;
        if path == ROOT_PATH {
            return Ok(Some(root));
        }
        if !self.metadata().contains(path) {
            return Ok(None);
        }
        Ok(self.version().cache.lookup_hash(path)?)
    }

    /// Leaf at `path`, or `None` if `path` is not a leaf of this version.
    pub fn leaf_at(&self, path: u64) -> Result<Option<LeafRecord>> {
        if !self.metadata().is_leaf(path) {
            return Ok(None);
        }
        Ok(self.version().cache.lookup_leaf_by_path(path)?)
    }

    /// Iterate leaves in path order.
    ///
    /// On the head, a mutation during iteration ends it with
    /// [`MapError::ConcurrentModification`].
    pub fn leaves(&self) -> Leaves {
        let metadata = self.metadata();
        Leaves {
            map: self.clone(),
            next: metadata.first_leaf_path,
            last: metadata.last_leaf_path,
            modifications: self.version().modifications(),
            done: metadata.is_empty(),
        }
    }

    /// Recompute every hash of this sealed version; returns the first path
    /// whose stored hash is wrong.
    pub fn verify(&self) -> Result<Option<u64>> {
        hasher::verify_tree(self)
    }

    /// Flush this version and snapshot the data source into `directory`.
    ///
    /// Fails with [`MapError::SnapshotStale`] if a newer version reached the
    /// data source first.
    #[instrument(skip(self), fields(generation = self.generation()))]
    pub fn snapshot(&self, directory: &Path) -> Result<()> {
        let version = self.ensure_sealed()?;
        let root = self.root_hash()?;
        self.flush()?;
        self.wait_until_flushed()?;

        let result = {
            let _paused = self.pipeline().pause();
            match self.pipeline().flushed_generation() {
                Some(flushed) if flushed != version.generation => Err(MapError::SnapshotStale {
                    requested: version.generation,
                    flushed,
                }),
                _ => self.data_source().snapshot(directory).map_err(MapError::from),
            }
        };
        self.pipeline().schedule();
        result?;

        SnapshotManifest::read(directory)?
            .with_version(version.generation, root)
            .write(directory)?;
        info!(dir = %directory.display(), root = %root, "Wrote map snapshot");
        Ok(())
    }
}

/// Iterator over the leaves of one version, in path order.
pub struct Leaves {
    map: VirtualMap,
    next: u64,
    last: u64,
    modifications: u64,
    done: bool,
}

impl Iterator for Leaves {
    type Item = Result<LeafRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.map.version().modifications() != self.modifications {
            self.done = true;
            return Some(Err(MapError::ConcurrentModification {
                generation: self.map.generation(),
            }));
        }
        let path = self.next;
        self.done = path >= self.last;
        self.next += 1;
        match self.map.leaf_at(path) {
            Ok(Some(leaf)) => Some(Ok(leaf)),
            Ok(None) => {
                self.done = true;
                Some(Err(MapError::Corrupt(format!("no leaf at path {path}"))))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
