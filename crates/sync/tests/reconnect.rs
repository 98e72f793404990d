//! Teacher and learner sessions over an in-memory duplex stream.

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use vmap_engine::{MapConfig, VirtualMap};
use vmap_messages::{Handshake, LearnerMessage, Lessons, TeacherMessage};
use vmap_storage::{DataSource, DiskDataSource, MemoryDataSource, StorageConfig};
use vmap_sync::{
    FramedStream, Learner, ReconnectConfig, ReconnectError, ReconnectStats, Reconnected, Teacher,
};
use vmap_types::{empty_root_hash, hash_internal, Hash, LeafRecord, MapMetadata};

fn pool() -> Arc<rayon::ThreadPool> {
    Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap(),
    )
}

fn map_config() -> MapConfig {
    MapConfig::default()
        .with_flush_threshold(usize::MAX)
        .with_flush_interval(Duration::from_secs(3600))
}

fn memory() -> Arc<dyn DataSource> {
    Arc::new(MemoryDataSource::new())
}

fn disk(dir: &Path) -> Arc<dyn DataSource> {
    Arc::new(DiskDataSource::open(dir, StorageConfig::unsynced()).unwrap())
}

/// Build a version over `data_source` and seal it.
fn sealed(data_source: Arc<dyn DataSource>, build: impl FnOnce(&VirtualMap)) -> VirtualMap {
    let head = VirtualMap::new(data_source, map_config(), pool()).unwrap();
    build(&head);
    let sealed = head.clone();
    head.copy().unwrap();
    sealed
}

fn put_all(map: &VirtualMap, keys: impl IntoIterator<Item = usize>, tag: &str) {
    for i in keys {
        map.put(format!("k{i}"), format!("{tag}{i}")).unwrap();
    }
}

fn contents(map: &VirtualMap) -> Vec<(u64, Bytes, Bytes)> {
    map.leaves()
        .map(|leaf| {
            let leaf = leaf.unwrap();
            (leaf.path, leaf.key, leaf.value)
        })
        .collect()
}

async fn reconnect(
    teacher: &VirtualMap,
    original: &VirtualMap,
    work_dir: &Path,
    config: ReconnectConfig,
) -> (ReconnectStats, Reconnected) {
    let (teacher_end, learner_end) = tokio::io::duplex(64 * 1024);
    let teacher = Teacher::new(teacher.clone(), config.clone());
    let learner = Learner::new(original.clone(), work_dir, config);
    let (taught, learned) = tokio::join!(teacher.run(teacher_end), learner.run(learner_end));
    (taught.unwrap(), learned.unwrap())
}

/// Seal the rebuilt head and check it is the teacher's tree.
fn assert_converged(learned: Reconnected, teacher: &VirtualMap) -> VirtualMap {
    let head = learned.map;
    let result = head.clone();
    head.copy().unwrap();

    let root = teacher.root_hash().unwrap();
    assert_eq!(learned.root_hash, root);
    assert_eq!(result.root_hash().unwrap(), root);
    assert_eq!(result.metadata(), teacher.metadata());
    assert_eq!(contents(&result), contents(teacher));
    assert_eq!(result.verify().unwrap(), None);
    result
}

#[tokio::test]
async fn test_disjoint_trees_converge() {
    let dir = tempfile::tempdir().unwrap();
    let teacher = sealed(memory(), |m| put_all(m, 0..200, "t"));
    let original = sealed(disk(&dir.path().join("learner")), |m| {
        put_all(m, 1000..1150, "l")
    });

    let (taught, learned) = reconnect(
        &teacher,
        &original,
        &dir.path().join("fork"),
        ReconnectConfig::default(),
    )
    .await;
    assert_eq!(taught.leaves_sent, 200);
    assert_eq!(learned.stats.leaves_received, 200);
    assert_eq!(learned.stats.stale_leaves_removed, 150);
    let result = assert_converged(learned, &teacher);
    assert_eq!(result.get(b"k1000").unwrap(), None);

    // The original tree is untouched.
    assert_eq!(original.len(), 150);
    assert_eq!(original.get(b"k1000").unwrap().as_deref(), Some(&b"l1000"[..]));
}

#[tokio::test]
async fn test_identical_trees_send_no_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let teacher = sealed(memory(), |m| put_all(m, 0..500, "v"));
    let original = sealed(memory(), |m| put_all(m, 0..500, "v"));

    let (taught, learned) =
        reconnect(&teacher, &original, dir.path(), ReconnectConfig::default()).await;
    assert_eq!(taught.rounds, 1);
    assert_eq!(taught.queries_sent, 1);
    assert_eq!(taught.leaves_sent, 0);
    assert_eq!(learned.stats.mismatched, 0);
    assert_eq!(learned.stats.stale_leaves_removed, 0);
    assert_converged(learned, &teacher);
}

#[tokio::test]
async fn test_overlapping_trees_converge() {
    for seed in [1u64, 2, 3] {
        for batch in [7usize, 1024] {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut diverge = |map: &VirtualMap, tag: &str| {
                for n in 0..150 {
                    let key = format!("k{}", rng.gen_range(0..400));
                    if rng.gen_bool(0.3) {
                        map.delete(key.as_bytes()).unwrap();
                    } else {
                        map.put(key, format!("{tag}{n}")).unwrap();
                    }
                }
            };
            let teacher = sealed(memory(), |m| {
                put_all(m, 0..300, "v");
                diverge(m, "t");
            });
            let dir = tempfile::tempdir().unwrap();
            let original = sealed(disk(&dir.path().join("learner")), |m| {
                put_all(m, 0..300, "v");
                diverge(m, "l");
            });

            let config = ReconnectConfig::default()
                .with_max_queries_per_round(batch)
                .with_learner_flush_threshold(64);
            let (taught, learned) =
                reconnect(&teacher, &original, &dir.path().join("fork"), config).await;
            assert!(taught.leaves_sent < teacher.len(), "seed {seed}");
            assert!(learned.stats.flushes >= 1);
            assert_converged(learned, &teacher);
        }
    }
}

#[tokio::test]
async fn test_moved_key_is_not_deleted() {
    // Learner: a@3 b@2 c@4.
    let original = sealed(memory(), |m| {
        for key in ["a", "b", "c"] {
            m.put(key, "v").unwrap();
        }
    });
    // Teacher: b@2 c@3 z@4. "c" moved up, a new key took its old path.
    let teacher = sealed(memory(), |m| {
        for key in ["a", "b", "c"] {
            m.put(key, "v").unwrap();
        }
        m.delete(b"a").unwrap();
        m.put("z", "v").unwrap();
    });
    let c_learner = original.get_leaf(b"c").unwrap().unwrap().path;
    let c_teacher = teacher.get_leaf(b"c").unwrap().unwrap().path;
    assert!(c_teacher < c_learner);
    assert_eq!(teacher.get_leaf(b"z").unwrap().unwrap().path, c_learner);

    for batch in [1usize, 1024] {
        let dir = tempfile::tempdir().unwrap();
        let config = ReconnectConfig::default().with_max_queries_per_round(batch);
        let (_, learned) = reconnect(&teacher, &original, dir.path(), config).await;
        let result = assert_converged(learned, &teacher);
        assert_eq!(result.get_leaf(b"c").unwrap().unwrap().path, c_teacher);
        assert_eq!(result.get(b"a").unwrap(), None);
        assert_eq!(result.len(), 3);
    }
}

#[tokio::test]
async fn test_learner_shrinks_and_grows() {
    let small = sealed(memory(), |m| put_all(m, 0..5, "s"));
    let large = sealed(memory(), |m| put_all(m, 0..400, "l"));
    let empty = sealed(memory(), |_| {});

    for (teacher, original) in [
        (&small, &large),
        (&large, &small),
        (&empty, &small),
        (&small, &empty),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let (_, learned) =
            reconnect(teacher, original, dir.path(), ReconnectConfig::default()).await;
        let result = assert_converged(learned, teacher);
        if teacher.is_empty() {
            assert_eq!(result.root_hash().unwrap(), empty_root_hash());
        }
    }
}

#[tokio::test]
async fn test_silent_teacher_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let original = sealed(disk(&dir.path().join("learner")), |m| put_all(m, 0..10, "v"));
    let work_dir = dir.path().join("fork");
    let (_silent, learner_end) = tokio::io::duplex(64 * 1024);

    let config = ReconnectConfig::default().with_async_stream_timeout(Duration::from_millis(100));
    let result = Learner::new(original.clone(), &work_dir, config)
        .run(learner_end)
        .await;

    assert!(matches!(
        result,
        Err(ReconnectError::Timeout {
            waiting_for: "handshake"
        })
    ));
    assert!(!work_dir.exists());
    assert_eq!(original.len(), 10);
    assert_eq!(original.get(b"k3").unwrap().as_deref(), Some(&b"v3"[..]));
}

#[tokio::test]
async fn test_forged_leaf_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let original = sealed(memory(), |_| {});
    let (teacher_end, learner_end) = tokio::io::duplex(64 * 1024);

    let leaf = LeafRecord::new(1, b"k".to_vec(), b"v".to_vec());
    let root = hash_internal(&leaf.hash(), &Hash::ZERO);
    let forger = async move {
        let mut framed = FramedStream::new(teacher_end, 1 << 20);
        let handshake = Handshake::new(MapMetadata::for_size(1), root);
        framed
            .send(&TeacherMessage::Handshake(handshake))
            .await
            .unwrap();
        assert_eq!(
            framed.recv::<LearnerMessage>().await.unwrap(),
            LearnerMessage::HandshakeAck
        );
        for query in [(0, root), (1, leaf.hash())] {
            framed
                .send(&TeacherMessage::Lessons(Lessons::new(vec![query], vec![])))
                .await
                .unwrap();
            match framed.recv::<LearnerMessage>().await.unwrap() {
                LearnerMessage::Answers(answers) => assert_eq!(answers.mismatched, vec![query.0]),
                other => panic!("unexpected {other:?}"),
            }
        }
        let forged = leaf.with_value(b"forged".to_vec());
        framed
            .send(&TeacherMessage::Lessons(Lessons::new(vec![], vec![forged])))
            .await
            .unwrap();
        framed.recv::<LearnerMessage>().await.unwrap()
    };

    let learner = Learner::new(original, dir.path(), ReconnectConfig::default());
    let (reply, result) = tokio::join!(forger, learner.run(learner_end));
    assert!(matches!(result, Err(ReconnectError::HashMismatch { path: 1 })));
    assert!(matches!(reply, LearnerMessage::Abort { .. }));
}

#[tokio::test]
async fn test_oversized_handshake_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let original = sealed(memory(), |m| put_all(m, 0..4, "v"));
    let (teacher_end, learner_end) = tokio::io::duplex(64 * 1024);

    let liar = async move {
        let mut framed = FramedStream::new(teacher_end, 1 << 20);
        let shape = MapMetadata::from_leaf_paths(0, u64::MAX - 1);
        assert_eq!(shape.size, u64::MAX);
        framed
            .send(&TeacherMessage::Handshake(Handshake::new(shape, Hash::ZERO)))
            .await
            .unwrap();
        framed.recv::<LearnerMessage>().await.unwrap()
    };

    let learner = Learner::new(original.clone(), dir.path().join("fork"), ReconnectConfig::default());
    let (reply, result) = tokio::join!(liar, learner.run(learner_end));
    assert!(matches!(result, Err(ReconnectError::Protocol(_))));
    assert!(matches!(reply, LearnerMessage::Abort { .. }));
    assert_eq!(original.len(), 4);
}

#[tokio::test]
async fn test_empty_lessons_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let original = sealed(memory(), |m| put_all(m, 0..4, "v"));
    let (teacher_end, learner_end) = tokio::io::duplex(64 * 1024);

    let stalling = async move {
        let mut framed = FramedStream::new(teacher_end, 1 << 20);
        framed
            .send(&TeacherMessage::Handshake(Handshake::new(
                MapMetadata::for_size(4),
                Hash::from_bytes(b"root"),
            )))
            .await
            .unwrap();
        let ack = framed.recv::<LearnerMessage>().await.unwrap();
        assert_eq!(ack, LearnerMessage::HandshakeAck);
        framed
            .send(&TeacherMessage::Lessons(Lessons::default()))
            .await
            .unwrap();
        framed.recv::<LearnerMessage>().await.unwrap()
    };

    let learner = Learner::new(original.clone(), dir.path().join("fork"), ReconnectConfig::default());
    let (reply, result) = tokio::join!(stalling, learner.run(learner_end));
    assert!(matches!(result, Err(ReconnectError::Protocol(_))));
    assert!(matches!(reply, LearnerMessage::Abort { .. }));
}

#[tokio::test]
async fn test_teacher_reports_learner_abort() {
    let teacher = sealed(memory(), |m| put_all(m, 0..10, "v"));
    let (teacher_end, learner_end) = tokio::io::duplex(64 * 1024);

    let refuser = async move {
        let mut framed = FramedStream::new(learner_end, 1 << 20);
        let handshake = framed.recv::<TeacherMessage>().await.unwrap();
        assert!(matches!(handshake, TeacherMessage::Handshake(_)));
        framed
            .send(&LearnerMessage::Abort {
                reason: "busy".to_string(),
            })
            .await
            .unwrap();
    };

    let teaching = Teacher::new(teacher, ReconnectConfig::default()).run(teacher_end);
    let (result, ()) = tokio::join!(teaching, refuser);
    match result {
        Err(ReconnectError::Aborted { reason }) => assert_eq!(reason, "busy"),
        other => panic!("unexpected {other:?}"),
    }
}
