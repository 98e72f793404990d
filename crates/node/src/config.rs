//! Node configuration, loaded from a TOML file.

use crate::rate_limiter::RateLimitConfig;
use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use vmap_engine::MapConfig;
use vmap_storage::StorageConfig;
use vmap_sync::ReconnectConfig;

/// Everything a node needs to open maps and serve or run reconnects.
///
/// Every section is optional in the file; missing fields take their
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub storage: StorageConfig,
    pub map: MapConfig,
    pub reconnect: ReconnectConfig,
    pub rate_limit: RateLimitConfig,

    /// Threads in the hashing pool. Zero means one per core.
    pub hash_threads: usize,
}

impl NodeConfig {
    /// Read a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Build the hashing pool.
    pub fn thread_pool(&self) -> Result<Arc<ThreadPool>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.hash_threads)
            .thread_name(|i| format!("vmap-hash-{i}"))
            .build()
            .context("building hash thread pool")?;
        Ok(Arc::new(pool))
    }
}
