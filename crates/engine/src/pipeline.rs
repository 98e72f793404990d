//! Background hashing, flushing and merging of sealed versions.
//!
//! All versions of one map live in a queue, oldest first; the head is always
//! last. One worker at a time walks the queue on the map's thread pool:
//!
//! 1. Sealed versions are hashed strictly in seal order.
//! 2. The oldest version is retired once it is released and either flushed
//!    or never sealed.
//! 3. The oldest version is flushed when it is sealed, hashed and due: a
//!    flush was requested for it or a newer version, or it was released and
//!    crossed the size or age threshold of [`MapConfig`].
//! 4. A released oldest version that is not due is merged into the next
//!    version's cache once that version is sealed and hashed. Until then a
//!    timer wakes the worker when the version comes of age.
//!
//! A version only reaches the data source after every older version has been
//! released, so no live version ever reads state newer than its own.

use crate::flush::FlushSet;
use crate::hasher::hash_version;
use crate::version::Version;
use crate::MapConfig;
use parking_lot::{Mutex, MutexGuard};
use rayon::ThreadPool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use vmap_storage::DataSource;

pub(crate) struct Pipeline {
    data_source: Arc<dyn DataSource>,
    config: MapConfig,
    pool: Arc<ThreadPool>,
    versions: Mutex<VecDeque<Arc<Version>>>,
    /// Held by the single active worker.
    worker: Mutex<()>,
    rerun: AtomicBool,
    /// Set while a flush timer is sleeping.
    timer_armed: AtomicBool,
    /// Generation the data source currently reflects.
    flushed_generation: Mutex<Option<u64>>,
}

/// What to do with the oldest version.
enum Step {
    Retire(Arc<Version>, Option<Arc<Version>>),
    Flush(Arc<Version>),
    Merge(Arc<Version>, Arc<Version>),
    /// Released but neither due nor mergeable; due by age after the delay.
    Wait(Duration),
    Idle,
}

impl Pipeline {
    pub fn new(
        data_source: Arc<dyn DataSource>,
        config: MapConfig,
        pool: Arc<ThreadPool>,
        head: Arc<Version>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_source,
            config,
            pool,
            versions: Mutex::new(VecDeque::from([head])),
            worker: Mutex::new(()),
            rerun: AtomicBool::new(false),
            timer_armed: AtomicBool::new(false),
            flushed_generation: Mutex::new(None),
        })
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Seal `head` and queue `next` as the new head, atomically with respect
    /// to the worker.
    pub fn seal(self: &Arc<Self>, head: &Version, next: Arc<Version>) {
        {
            let mut versions = self.versions.lock();
            head.seal();
            versions.push_back(next);
        }
        debug!(generation = head.generation, "Sealed version");
        self.schedule();
    }

    pub fn release(self: &Arc<Self>, version: &Version) {
        version.mark_released();
        debug!(generation = version.generation, "Released version");
        self.schedule();
    }

    pub fn request_flush(self: &Arc<Self>, version: &Version) {
        version.request_flush();
        self.schedule();
    }

    /// Number of versions still held.
    pub fn retained(&self) -> usize {
        self.versions.lock().len()
    }

    /// Generation the data source holds, if any version was flushed.
    pub fn flushed_generation(&self) -> Option<u64> {
        *self.flushed_generation.lock()
    }

    /// Keep the worker from running while the guard is held.
    ///
    /// Call [`Pipeline::schedule`] after dropping the guard: work that arrived
    /// in the meantime was deferred.
    pub fn pause(&self) -> MutexGuard<'_, ()> {
        self.worker.lock()
    }

    pub fn schedule(self: &Arc<Self>) {
        self.rerun.store(true, Ordering::Release);
        let this = Arc::clone(self);
        self.pool.spawn(move || this.process());
    }

    fn process(self: &Arc<Self>) {
        loop {
            let Some(guard) = self.worker.try_lock() else {
                // The active worker picks up the rerun flag.
                return;
            };
            while self.rerun.swap(false, Ordering::AcqRel) {
                self.run_once();
            }
            drop(guard);
            if !self.rerun.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn run_once(self: &Arc<Self>) {
        self.hash_sealed();
        loop {
            match self.next_step() {
                Step::Retire(version, next) => {
                    self.versions.lock().pop_front();
                    // After a failed flush the successor keeps reading through
                    // the retired cache.
                    if let Some(next) = next.filter(|_| version.flushed.succeeded()) {
                        next.cache.detach();
                    }
                    debug!(generation = version.generation, "Retired version");
                }
                Step::Flush(version) => {
                    if !self.flush(&version) {
                        return;
                    }
                }
                Step::Merge(version, next) => {
                    version.cache.merge_into(&next.cache);
                    self.versions.lock().pop_front();
                    debug!(
                        generation = version.generation,
                        into = next.generation,
                        "Merged version into successor"
                    );
                }
                Step::Wait(delay) => {
                    self.wake_after(delay);
                    return;
                }
                Step::Idle => return,
            }
        }
    }

    /// Schedule the worker again after `delay`. At most one timer sleeps at
    /// a time; the oldest version always has the nearest deadline.
    fn wake_after(self: &Arc<Self>, delay: Duration) {
        if self.timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pipeline = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("vmap-flush-timer".into())
            .spawn(move || {
                thread::sleep(delay);
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.timer_armed.store(false, Ordering::Release);
                    pipeline.schedule();
                }
            });
        match spawned {
            Ok(_) => debug!(delay_ms = delay.as_millis() as u64, "Armed flush timer"),
            Err(e) => {
                self.timer_armed.store(false, Ordering::Release);
                warn!(error = %e, "Failed to start flush timer");
            }
        }
    }

    fn hash_sealed(&self) {
        let versions: Vec<Arc<Version>> = self.versions.lock().iter().cloned().collect();
        let mut previous_failed = false;
        for version in versions.iter().take_while(|v| v.is_sealed()) {
            if let Some(result) = version.hashed.get() {
                previous_failed = result.is_err();
                continue;
            }
            if previous_failed {
                version
                    .hashed
                    .complete(Err("an older version failed to hash".into()));
                continue;
            }
            let start = Instant::now();
            match hash_version(version) {
                Ok(root) => {
                    debug!(
                        generation = version.generation,
                        root = %root,
                        elapsed_us = start.elapsed().as_micros() as u64,
                        "Hashed version"
                    );
                    version.hashed.complete(Ok(root));
                }
                Err(e) => {
                    error!(generation = version.generation, error = %e, "Hashing failed");
                    version.hashed.complete(Err(e.to_string()));
                    previous_failed = true;
                }
            }
        }
    }

    fn next_step(&self) -> Step {
        let versions = self.versions.lock();
        let Some(front) = versions.front().cloned() else {
            return Step::Idle;
        };
        let next = versions.get(1).cloned();

        if front.is_released() && (front.flushed.is_done() || !front.is_sealed()) {
            return Step::Retire(front, next);
        }
        if !front.is_sealed() || !front.hashed.succeeded() || front.flushed.is_done() {
            return Step::Idle;
        }

        let requested = versions
            .iter()
            .any(|v| v.flush_requested() && !v.flushed.is_done());
        let due = requested || (front.is_released() && self.past_threshold(&front));
        if due {
            return Step::Flush(front);
        }
        if front.is_released() {
            if let Some(next) = next.filter(|n| n.is_sealed() && n.hashed.succeeded()) {
                return Step::Merge(front, next);
            }
            return Step::Wait(self.config.flush_interval.saturating_sub(front.age()));
        }
        Step::Idle
    }

    fn past_threshold(&self, version: &Version) -> bool {
        version.cache.len() >= self.config.flush_threshold
            || version.age() >= self.config.flush_interval
    }

    /// Write a version to the data source. Returns whether it succeeded.
    #[instrument(skip(self, version), fields(generation = version.generation))]
    fn flush(&self, version: &Version) -> bool {
        let start = Instant::now();
        let set = FlushSet::from_cache(&version.cache, version.metadata());
        let records = set.len();
        if let Err(e) = set.apply(self.data_source.as_ref(), false) {
            error!(error = %e, "Flush failed");
            version.flushed.complete(Err(e.to_string()));
            return false;
        }
        *self.flushed_generation.lock() = Some(version.generation);
        version.flushed.complete(Ok(()));
        info!(
            records,
            size = version.metadata().size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Flushed version"
        );

        if self.config.compact_after_flush && self.data_source.needs_compaction() {
            if let Err(e) = self.data_source.compact() {
                warn!(error = %e, "Compaction after flush failed");
            }
        }
        true
    }
}
