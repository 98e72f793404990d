//! Node operations behind the `vmap` subcommands.
//!
//! Map operations block, so the async commands run them on tokio's blocking
//! pool.

use crate::config::NodeConfig;
use crate::rate_limiter::{RateLimitConfig, SessionRateLimiter};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use vmap_engine::VirtualMap;
use vmap_storage::{BackendKind, SnapshotManifest};
use vmap_sync::{Learner, ReconnectConfig, Teacher};
use vmap_types::{Hash, MapMetadata};

/// What `inspect` reports about a snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub backend: BackendKind,
    pub generation: Option<u64>,
    pub metadata: MapMetadata,
    pub root_hash: Hash,
}

impl fmt::Display for SnapshotSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match self.backend {
            BackendKind::Memory => "memory",
            BackendKind::Disk => "disk",
        };
        writeln!(f, "backend:    {backend}")?;
        match self.generation {
            Some(generation) => writeln!(f, "generation: {generation}")?,
            None => writeln!(f, "generation: -")?,
        }
        writeln!(f, "leaves:     {}", self.metadata.size)?;
        if self.metadata.size > 0 {
            writeln!(
                f,
                "leaf paths: {}..={}",
                self.metadata.first_leaf_path, self.metadata.last_leaf_path
            )?;
        }
        write!(f, "root:       {}", self.root_hash)
    }
}

/// Restore a snapshot and seal it. Returns the sealed version and its head.
fn open_sealed(dir: &Path, config: &NodeConfig) -> Result<(VirtualMap, VirtualMap)> {
    let map = VirtualMap::restore(
        dir,
        config.storage.clone(),
        config.map.clone(),
        config.thread_pool()?,
    )
    .with_context(|| format!("restoring snapshot {}", dir.display()))?;
    let head = map.copy()?;
    Ok((map, head))
}

/// Describe the snapshot in `dir`.
pub fn inspect(dir: &Path, config: &NodeConfig) -> Result<SnapshotSummary> {
    let manifest = SnapshotManifest::read(dir)
        .with_context(|| format!("reading manifest in {}", dir.display()))?;
    let (sealed, _head) = open_sealed(dir, config)?;
    Ok(SnapshotSummary {
        backend: manifest.backend,
        generation: manifest.generation,
        metadata: sealed.metadata(),
        root_hash: sealed.root_hash()?,
    })
}

/// Recompute every hash in the snapshot in `dir`.
///
/// Returns the first path whose stored hash is wrong.
pub fn verify(dir: &Path, config: &NodeConfig) -> Result<Option<u64>> {
    let (sealed, _head) = open_sealed(dir, config)?;
    let bad = sealed.verify()?;
    match bad {
        Some(path) => warn!(dir = %dir.display(), path, "Snapshot failed verification"),
        None => info!(dir = %dir.display(), size = sealed.len(), "Snapshot verified"),
    }
    Ok(bad)
}

/// Accept reconnect sessions on `listener` until `shutdown` resolves.
///
/// Every session teaches `map`, which must be sealed. Peers over their
/// session budget are disconnected without a handshake.
pub async fn serve(
    listener: TcpListener,
    map: VirtualMap,
    reconnect: ReconnectConfig,
    limits: RateLimitConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    if !map.is_sealed() {
        bail!("only a sealed version can be taught");
    }
    let mut limiter = SessionRateLimiter::new(limits);
    tokio::pin!(shutdown);

    info!(
        addr = %listener.local_addr()?,
        generation = map.generation(),
        size = map.len(),
        "Serving reconnect sessions"
    );

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        if !limiter.check_session(peer.ip()) {
            warn!(peer = %peer, "Rate limited reconnect session");
            continue;
        }

        let teacher = Teacher::new(map.clone(), reconnect.clone());
        tokio::spawn(async move {
            match teacher.run(stream).await {
                Ok(stats) => debug!(peer = %peer, rounds = stats.rounds, "Session closed"),
                Err(e) => debug!(peer = %peer, error = %e, "Session failed"),
            }
        });
    }

    info!("Stopped serving reconnect sessions");
    Ok(())
}

/// Serve the snapshot in `dir` on `addr` until ctrl-c.
pub async fn teach(dir: PathBuf, addr: SocketAddr, config: NodeConfig) -> Result<()> {
    let node = config.clone();
    let (sealed, _head) = tokio::task::spawn_blocking(move || {
        let opened = open_sealed(&dir, &node)?;
        // Hash up front so the first session does not pay for it.
        opened.0.root_hash()?;
        Ok::<_, anyhow::Error>(opened)
    })
    .await??;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    serve(
        listener,
        sealed,
        config.reconnect.clone(),
        config.rate_limit.clone(),
        shutdown,
    )
    .await
}

/// Bring the snapshot in `dir` up to date with the teacher at `addr` and
/// write the result to `out`.
///
/// `dir` is left as it was. The rebuilt tree is assembled in `work_dir`,
/// which is removed once `out` is written.
pub async fn learn(
    dir: PathBuf,
    addr: SocketAddr,
    out: PathBuf,
    work_dir: PathBuf,
    config: NodeConfig,
) -> Result<Hash> {
    if out.exists() {
        bail!("output directory {} already exists", out.display());
    }

    let node = config.clone();
    let (original, head) = tokio::task::spawn_blocking(move || open_sealed(&dir, &node)).await??;
    // The learner flushes the original, which must be the oldest live version.
    drop(head);

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    stream.set_nodelay(true)?;

    let reconnected = Learner::new(original, work_dir, config.reconnect.clone())
        .run(stream)
        .await
        .context("reconnect failed")?;
    let root_hash = reconnected.root_hash;
    let map = reconnected.map;

    tokio::task::spawn_blocking(move || {
        let data_source = map.data_source().clone();
        let head = map.copy()?;
        map.snapshot(&out)
            .with_context(|| format!("writing snapshot {}", out.display()))?;
        drop(head);
        drop(map);
        data_source.close(false)?;
        info!(out = %out.display(), root = %root_hash, "Wrote reconnected snapshot");
        Ok::<_, anyhow::Error>(())
    })
    .await??;

    Ok(root_hash)
}
