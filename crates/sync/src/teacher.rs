//! Serving side of a reconnect.

use crate::codec::FramedStream;
use crate::session::{blocking, recv_within, send_abort};
use crate::view::{NodeKind, TreeView};
use crate::{ReconnectConfig, ReconnectError, ReconnectStats, Result};
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use vmap_engine::{MapError, VirtualMap};
use vmap_messages::{Handshake, LearnerMessage, Lessons, TeacherMessage};
use vmap_types::{Path, ROOT_PATH};

/// Walks a sealed version top-down and sends the learner every node it does
/// not already have.
///
/// Each round puts up to `max_queries_per_round` node hashes for comparison
/// and sends up to as many leaves the learner reported missing. A mismatched
/// internal node has its children queried in a later round; a mismatched leaf
/// is sent in a later round.
#[derive(Debug)]
pub struct Teacher {
    view: TreeView,
    config: ReconnectConfig,
}

impl Teacher {
    /// Teacher serving `map`, which must be sealed.
    pub fn new(map: VirtualMap, config: ReconnectConfig) -> Self {
        Self {
            view: TreeView::teacher(map),
            config,
        }
    }

    /// Run one session over `stream`.
    #[instrument(skip_all, fields(generation = self.view.map().generation()))]
    pub async fn run<S>(self, stream: S) -> Result<ReconnectStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let mut framed = FramedStream::new(stream, self.config.max_frame_size);
        let mut stats = ReconnectStats::default();

        let outcome = timeout(
            self.config.reconnect_budget,
            self.teach(&mut framed, &mut stats),
        )
        .await
        .unwrap_or(Err(ReconnectError::Timeout {
            waiting_for: "reconnect budget",
        }));
        stats.elapsed = start.elapsed();

        match outcome {
            Ok(()) => {
                info!(
                    rounds = stats.rounds,
                    queries = stats.queries_sent,
                    leaves = stats.leaves_sent,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "Reconnect teaching finished"
                );
                Ok(stats)
            }
            Err(e) => {
                warn!(error = %e, rounds = stats.rounds, "Reconnect teaching aborted");
                if e.should_notify_peer() {
                    let abort = TeacherMessage::Abort {
                        reason: e.to_string(),
                    };
                    send_abort(&mut framed, &abort, self.config.max_ack_delay).await;
                }
                Err(e)
            }
        }
    }

    async fn teach<S>(&self, framed: &mut FramedStream<S>, stats: &mut ReconnectStats) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let map = self.view.map().clone();
        let root_hash = blocking(move || Ok(map.root_hash()?)).await?;
        let shape = self.view.shape();
        info!(size = shape.size, root = %root_hash, "Reconnect teaching started");

        framed
            .send(&TeacherMessage::Handshake(Handshake::new(shape, root_hash)))
            .await?;
        match self.reply(framed, "handshake ack").await? {
            LearnerMessage::HandshakeAck => {}
            other => return Err(unexpected(&other)),
        }

        let batch = self.config.max_queries_per_round.max(1);
        let mut frontier: VecDeque<Path> = VecDeque::from([ROOT_PATH]);
        let mut leaf_paths: VecDeque<Path> = VecDeque::new();

        while !frontier.is_empty() || !leaf_paths.is_empty() {
            let query_paths: Vec<Path> = frontier.drain(..batch.min(frontier.len())).collect();
            let send_paths: Vec<Path> = leaf_paths.drain(..batch.min(leaf_paths.len())).collect();
            let view = self.view.clone();
            let lessons = blocking(move || build_lessons(&view, &query_paths, &send_paths)).await?;

            stats.rounds += 1;
            stats.queries_sent += lessons.queries.len() as u64;
            stats.leaves_sent += lessons.leaves.len() as u64;
            let mut queried: HashSet<Path> = lessons.queries.iter().map(|(p, _)| *p).collect();
            framed.send(&TeacherMessage::Lessons(lessons)).await?;

            let answers = match self.reply(framed, "answers").await? {
                LearnerMessage::Answers(answers) => answers,
                other => return Err(unexpected(&other)),
            };
            stats.mismatched += answers.mismatched.len() as u64;
            for path in answers.mismatched {
                if !queried.remove(&path) {
                    return Err(ReconnectError::Protocol(format!(
                        "answer names path {path}, which was not queried"
                    )));
                }
                match self.view.kind(path) {
                    NodeKind::Leaf => leaf_paths.push_back(path),
                    NodeKind::Internal => frontier.extend(self.view.children(path)),
                    NodeKind::Absent => {
                        return Err(ReconnectError::Protocol(format!(
                            "path {path} is not in the tree"
                        )))
                    }
                }
            }
            debug!(
                round = stats.rounds,
                queued = frontier.len() + leaf_paths.len(),
                "Reconnect round answered"
            );
        }

        framed.send(&TeacherMessage::Complete).await?;
        match self.reply(framed, "complete ack").await? {
            LearnerMessage::CompleteAck => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn reply<S>(
        &self,
        framed: &mut FramedStream<S>,
        waiting_for: &'static str,
    ) -> Result<LearnerMessage>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match recv_within(framed, self.config.max_ack_delay, waiting_for).await? {
            LearnerMessage::Abort { reason } => Err(ReconnectError::Aborted { reason }),
            message => Ok(message),
        }
    }
}

fn build_lessons(view: &TreeView, query_paths: &[Path], leaf_paths: &[Path]) -> Result<Lessons> {
    let queries = query_paths
        .iter()
        .map(|&path| match view.hash(path)? {
            Some(hash) => Ok((path, hash)),
            None => Err(missing("hash", path)),
        })
        .collect::<Result<Vec<_>>>()?;
    let leaves = leaf_paths
        .iter()
        .map(|&path| view.leaf(path)?.ok_or_else(|| missing("leaf", path)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Lessons::new(queries, leaves))
}

fn missing(what: &str, path: Path) -> ReconnectError {
    MapError::Corrupt(format!("sealed version has no {what} at path {path}")).into()
}

fn unexpected(message: &LearnerMessage) -> ReconnectError {
    ReconnectError::Protocol(format!("unexpected {}", message.message_type_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing_test::traced_test;
    use vmap_engine::MapConfig;
    use vmap_messages::Answers;
    use vmap_storage::MemoryDataSource;
    use vmap_types::empty_root_hash;

    fn empty_sealed() -> VirtualMap {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
        let head =
            VirtualMap::new(Arc::new(MemoryDataSource::new()), MapConfig::default(), pool).unwrap();
        let sealed = head.clone();
        head.copy().unwrap();
        sealed
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_tree_is_one_query() {
        let (teacher_end, learner_end) = tokio::io::duplex(4096);
        let learner = async move {
            let mut framed = FramedStream::new(learner_end, 4096);
            let handshake = match framed.recv::<TeacherMessage>().await.unwrap() {
                TeacherMessage::Handshake(handshake) => handshake,
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(handshake.metadata(), vmap_types::MapMetadata::EMPTY);
            framed.send(&LearnerMessage::HandshakeAck).await.unwrap();

            let lessons = match framed.recv::<TeacherMessage>().await.unwrap() {
                TeacherMessage::Lessons(lessons) => lessons,
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(lessons.queries, vec![(ROOT_PATH, empty_root_hash())]);
            framed
                .send(&LearnerMessage::Answers(Answers::default()))
                .await
                .unwrap();

            assert_eq!(
                framed.recv::<TeacherMessage>().await.unwrap(),
                TeacherMessage::Complete
            );
            framed.send(&LearnerMessage::CompleteAck).await.unwrap();
        };

        let teaching = Teacher::new(empty_sealed(), ReconnectConfig::default()).run(teacher_end);
        let (stats, ()) = tokio::join!(teaching, learner);
        let stats = stats.unwrap();
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.leaves_sent, 0);
        assert!(logs_contain("Reconnect teaching finished"));
    }

    #[tokio::test]
    async fn test_unqueried_answer_is_rejected() {
        let (teacher_end, learner_end) = tokio::io::duplex(4096);
        let learner = async move {
            let mut framed = FramedStream::new(learner_end, 4096);
            framed.recv::<TeacherMessage>().await.unwrap();
            framed.send(&LearnerMessage::HandshakeAck).await.unwrap();
            framed.recv::<TeacherMessage>().await.unwrap();
            framed
                .send(&LearnerMessage::Answers(Answers::new(vec![5])))
                .await
                .unwrap();
            framed.recv::<TeacherMessage>().await.unwrap()
        };

        let teaching = Teacher::new(empty_sealed(), ReconnectConfig::default()).run(teacher_end);
        let (result, reply) = tokio::join!(teaching, learner);
        assert!(matches!(result, Err(ReconnectError::Protocol(_))));
        assert!(matches!(reply, TeacherMessage::Abort { .. }));
    }
}
