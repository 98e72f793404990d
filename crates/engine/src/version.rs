//! Per-version state shared between map handles and the pipeline.

use crate::cache::NodeCache;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use vmap_types::{Hash, MapMetadata};

/// One-shot result slot that threads can block on.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    slot: Mutex<Option<Result<T, String>>>,
    ready: Condvar,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Store the result. Later calls are ignored.
    pub fn complete(&self, result: Result<T, String>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }

    /// Block until a result is stored.
    pub fn wait(&self) -> Result<T, String> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut slot);
        }
    }

    pub fn get(&self) -> Option<Result<T, String>> {
        self.slot.lock().clone()
    }

    pub fn is_done(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.slot.lock().as_ref(), Some(Ok(_)))
    }
}

/// One map version.
///
/// Lives as long as any handle or the pipeline refers to it. Its metadata
/// changes only while it is the head.
#[derive(Debug)]
pub(crate) struct Version {
    pub generation: u64,
    pub cache: Arc<NodeCache>,
    /// Shape of the previous version, as this version started from it.
    pub base: MapMetadata,
    metadata: RwLock<MapMetadata>,
    sealed: AtomicBool,
    released: AtomicBool,
    flush_requested: AtomicBool,
    modifications: AtomicU64,
    created: Instant,
    pub hashed: Completion<Hash>,
    pub flushed: Completion<()>,
}

impl Version {
    pub fn new(generation: u64, cache: Arc<NodeCache>, base: MapMetadata) -> Self {
        Self {
            generation,
            cache,
            base,
            metadata: RwLock::new(base),
            sealed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            modifications: AtomicU64::new(0),
            created: Instant::now(),
            hashed: Completion::new(),
            flushed: Completion::new(),
        }
    }

    pub fn metadata(&self) -> MapMetadata {
        *self.metadata.read()
    }

    pub fn set_metadata(&self, metadata: MapMetadata) {
        *self.metadata.write() = metadata;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn flush_requested(&self) -> bool {
        self.flush_requested.load(Ordering::Acquire)
    }

    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
    }

    pub fn modifications(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    pub fn record_modification(&self) {
        self.modifications.fetch_add(1, Ordering::AcqRel);
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completion_wakes_waiters() {
        let completion = Arc::new(Completion::<u32>::new());
        let waiter = {
            let completion = completion.clone();
            thread::spawn(move || completion.wait())
        };
        completion.complete(Ok(7));
        completion.complete(Ok(8));
        assert_eq!(waiter.join().unwrap(), Ok(7));
        assert!(completion.succeeded());
    }

    #[test]
    fn test_completion_error() {
        let completion = Completion::<()>::new();
        assert!(!completion.is_done());
        completion.complete(Err("disk gone".into()));
        assert_eq!(completion.get(), Some(Err("disk gone".to_string())));
        assert!(!completion.succeeded());
    }
}
