//! Receiving side of a reconnect.

use crate::codec::FramedStream;
use crate::remover::ReconnectNodeRemover;
use crate::session::{blocking, recv_within, send_abort};
use crate::view::{NodeKind, TreeView};
use crate::{ReconnectConfig, ReconnectError, ReconnectStats, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use vmap_engine::{FlushSet, VirtualMap};
use vmap_messages::{Answers, LearnerMessage, Lessons, TeacherMessage};
use vmap_storage::DataSource;
use vmap_types::{Hash, HashRecord, MapMetadata, Path};

/// Outcome of a successful reconnect.
#[derive(Debug)]
pub struct Reconnected {
    /// Mutable head over the rebuilt data source.
    pub map: VirtualMap,
    /// Root hash the teacher announced.
    pub root_hash: Hash,
    pub stats: ReconnectStats,
}

/// Rebuilds a lagging node's tree from a teacher.
///
/// The learner compares every node the teacher puts up against its original
/// sealed version and asks only for what differs. Everything it receives is
/// written to a fork of the original's data source in `work_dir`, so an
/// aborted session leaves the original untouched. The fork is deleted on
/// failure and becomes the data source of the returned map on success.
///
/// The original version is flushed first; every older version must already
/// be released.
#[derive(Debug)]
pub struct Learner {
    original: VirtualMap,
    work_dir: PathBuf,
    config: ReconnectConfig,
}

impl Learner {
    pub fn new(original: VirtualMap, work_dir: impl Into<PathBuf>, config: ReconnectConfig) -> Self {
        Self {
            original,
            work_dir: work_dir.into(),
            config,
        }
    }

    /// Run one session over `stream`.
    #[instrument(skip_all, fields(generation = self.original.generation()))]
    pub async fn run<S>(self, stream: S) -> Result<Reconnected>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let mut framed = FramedStream::new(stream, self.config.max_frame_size);

        let fork = match self.fork().await {
            Ok(fork) => fork,
            Err(e) => {
                self.abort(&mut framed, &e).await;
                return Err(e);
            }
        };

        let outcome = timeout(self.config.reconnect_budget, self.learn(&mut framed, &fork))
            .await
            .unwrap_or(Err(ReconnectError::Timeout {
                waiting_for: "reconnect budget",
            }));

        match outcome {
            Ok((root_hash, mut stats)) => {
                stats.elapsed = start.elapsed();
                let map = VirtualMap::new(
                    fork,
                    self.original.config().clone(),
                    self.original.pool().clone(),
                )?;
                info!(
                    size = map.len(),
                    rounds = stats.rounds,
                    leaves = stats.leaves_received,
                    removed = stats.stale_leaves_removed,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "Reconnect learning finished"
                );
                Ok(Reconnected {
                    map,
                    root_hash,
                    stats,
                })
            }
            Err(e) => {
                self.abort(&mut framed, &e).await;
                let discard = fork.clone();
                if let Err(close) = blocking(move || Ok(discard.close(false)?)).await {
                    warn!(error = %close, "Failed to discard partial tree");
                }
                Err(e)
            }
        }
    }

    async fn abort<S>(&self, framed: &mut FramedStream<S>, e: &ReconnectError)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        warn!(error = %e, "Reconnect learning aborted");
        if e.should_notify_peer() {
            let abort = LearnerMessage::Abort {
                reason: e.to_string(),
            };
            send_abort(framed, &abort, self.config.max_ack_delay).await;
        }
    }

    /// Flush the original and copy its data source into the work directory.
    async fn fork(&self) -> Result<Arc<dyn DataSource>> {
        let original = self.original.clone();
        let work_dir = self.work_dir.clone();
        blocking(move || {
            original.flush()?;
            original.wait_until_flushed()?;
            Ok(original.data_source().fork(&work_dir)?)
        })
        .await
    }

    async fn learn<S>(
        &self,
        framed: &mut FramedStream<S>,
        fork: &Arc<dyn DataSource>,
    ) -> Result<(Hash, ReconnectStats)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = match self.next_message(framed, "handshake").await? {
            TeacherMessage::Handshake(handshake) => handshake,
            other => return Err(unexpected(&other)),
        };
        let target = handshake.metadata();
        if !target.is_complete() {
            return Err(ReconnectError::Protocol(format!(
                "teacher announced a malformed tree {target:?}"
            )));
        }
        info!(size = target.size, root = %handshake.root_hash, "Reconnect learning started");
        framed.send(&LearnerMessage::HandshakeAck).await?;

        let threshold = self.config.learner_flush_threshold;
        let mut progress = Progress::new(
            TreeView::learner(self.original.clone(), target),
            self.config.validate_leaf_hashes,
        );
        loop {
            match self.next_message(framed, "lessons").await? {
                TeacherMessage::Lessons(lessons) if lessons.is_empty() => {
                    return Err(ReconnectError::Protocol(
                        "teacher sent an empty round of lessons".to_string(),
                    ));
                }
                TeacherMessage::Lessons(lessons) => {
                    let fork = fork.clone();
                    let (next, answers) = blocking(move || {
                        let answers = progress.learn(lessons)?;
                        if progress.pending.len() >= threshold {
                            progress.flush_into(fork.as_ref())?;
                        }
                        Ok((progress, answers))
                    })
                    .await?;
                    progress = next;
                    framed.send(&LearnerMessage::Answers(answers)).await?;
                }
                TeacherMessage::Complete => break,
                other => return Err(unexpected(&other)),
            }
        }

        let fork = fork.clone();
        let stats = blocking(move || {
            progress.finish()?;
            progress.flush_into(fork.as_ref())?;
            Ok(progress.stats)
        })
        .await?;
        framed.send(&LearnerMessage::CompleteAck).await?;
        Ok((handshake.root_hash, stats))
    }

    async fn next_message<S>(
        &self,
        framed: &mut FramedStream<S>,
        waiting_for: &'static str,
    ) -> Result<TeacherMessage>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match recv_within(framed, self.config.async_stream_timeout, waiting_for).await? {
            TeacherMessage::Abort { reason } => Err(ReconnectError::Aborted { reason }),
            message => Ok(message),
        }
    }
}

/// Learner state carried from round to round.
struct Progress {
    view: TreeView,
    remover: ReconnectNodeRemover,
    /// Hashes the teacher announced for leaves it still owes.
    claimed: HashMap<Path, Hash>,
    pending: FlushSet,
    validate: bool,
    stats: ReconnectStats,
}

impl Progress {
    fn new(view: TreeView, validate: bool) -> Self {
        let target = view.shape();
        Self {
            remover: ReconnectNodeRemover::new(view.map().clone()),
            view,
            claimed: HashMap::new(),
            pending: FlushSet::new(target),
            validate,
            stats: ReconnectStats::default(),
        }
    }

    /// Accept one round of lessons and work out the answers.
    fn learn(&mut self, lessons: Lessons) -> Result<Answers> {
        self.stats.rounds += 1;
        self.stats.queries_sent += lessons.queries.len() as u64;

        for leaf in lessons.leaves {
            let Some(claimed) = self.claimed.remove(&leaf.path) else {
                return Err(ReconnectError::Protocol(format!(
                    "unsolicited leaf at path {}",
                    leaf.path
                )));
            };
            if self.validate && leaf.hash() != claimed {
                return Err(ReconnectError::HashMismatch { path: leaf.path });
            }
            self.remover.leaf_received(&leaf)?;
            self.pending.leaves_to_add.push(leaf);
            self.stats.leaves_received += 1;
        }

        let mut mismatched = Vec::new();
        for (path, hash) in lessons.queries {
            let kind = self.view.kind(path);
            if kind == NodeKind::Absent {
                return Err(ReconnectError::Protocol(format!(
                    "query for path {path} outside the announced tree"
                )));
            }
            if self.view.hash(path)? == Some(hash) {
                continue;
            }
            self.pending.hashes.push(HashRecord::new(path, hash));
            if kind == NodeKind::Leaf {
                self.claimed.insert(path, hash);
            }
            mismatched.push(path);
        }
        self.stats.mismatched += mismatched.len() as u64;
        Ok(Answers::new(mismatched))
    }

    /// Queue deletions for everything the teacher's tree no longer holds.
    fn finish(&mut self) -> Result<()> {
        if !self.claimed.is_empty() {
            return Err(ReconnectError::Protocol(format!(
                "teacher completed with {} leaves outstanding",
                self.claimed.len()
            )));
        }
        let target: MapMetadata = self.view.shape();
        self.remover.all_received(&target)?;
        Ok(())
    }

    fn flush_into(&mut self, data_source: &dyn DataSource) -> Result<()> {
        let deletions = self.remover.drain_deletions();
        self.pending.leaves_to_delete.extend(deletions);
        self.pending.drain_into(data_source, true)?;
        self.stats.flushes += 1;
        self.stats.stale_leaves_removed = self.remover.removed();
        Ok(())
    }
}

fn unexpected(message: &TeacherMessage) -> ReconnectError {
    ReconnectError::Protocol(format!("unexpected {}", message.message_type_id()))
}
