//! Lock stage - shares a non-reentrant upstream between threads
//!
//! **Why**: decoders keep seek state and cannot be called concurrently. The
//! lock serialises every upstream call behind one mutex and gives each calling
//! thread its own cursor, so N threads share one decode and one cache while
//! each sees an independent playback position.
//!
//! **Used by**: Fork (shared input of all branches), Voodoo, Scheduler
//! (wraps the terminals of its worker graphs)
//!
//! # Sync propagation
//!
//! With `sync_propagate = 1` a sync re-reads the upstream length. Graph
//! clones that share this lock set it to 0 after the first sync, so every
//! clone sees the same frame count.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::core::FrameLru;
use crate::entities::keys::{O_IMAGE, O_QUEUE_SIZE, O_SYNC_PROPAGATE, flag};
use crate::entities::{
    Capability, CapabilityKind, Frame, Source, SourceKind, SourceRef, SyncControl, clamp_position,
};
use crate::error::{GraphError, GraphResult};

const STAGE: &str = "lock";

struct LockState {
    upstream: Option<SourceRef>,
    frames: i32,
    cursors: HashMap<ThreadId, i32>,
    lru: FrameLru,
    queue_size: usize,
}

impl LockState {
    fn cursor(&mut self) -> i32 {
        *self.cursors.entry(thread::current().id()).or_insert(0)
    }
}

/// Thread-safe caching wrapper around one upstream
pub struct Lock {
    uuid: Uuid,
    serialise_as: Option<&'static str>,
    state: Mutex<LockState>,
    image: AtomicBool,
    sync_propagate: AtomicBool,
}

impl Lock {
    pub fn new() -> Self {
        Self::with_config(&LockConfig::default())
    }

    pub fn with_config(config: &LockConfig) -> Self {
        let queue_size = config.queue_size.max(1);
        Self {
            uuid: Uuid::new_v4(),
            serialise_as: None,
            state: Mutex::new(LockState {
                upstream: None,
                frames: 0,
                cursors: HashMap::new(),
                lru: FrameLru::new(queue_size),
                queue_size,
            }),
            image: AtomicBool::new(config.image),
            sync_propagate: AtomicBool::new(config.sync_propagate),
        }
    }

    /// Name reported in graph dumps (`""` hides the stage)
    pub fn with_serialise_as(mut self, tag: &'static str) -> Self {
        self.serialise_as = Some(tag);
        self
    }

    /// Lock already connected to `upstream`
    pub fn wrap(upstream: SourceRef, config: &LockConfig, tag: Option<&'static str>) -> GraphResult<SourceRef> {
        let mut lock = Lock::with_config(config);
        lock.serialise_as = tag;
        lock.connect(upstream, 0)?;
        Ok(Arc::new(lock))
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config(&self) -> LockConfig {
        LockConfig {
            queue_size: self.state().queue_size,
            image: self.image.load(Ordering::Relaxed),
            sync_propagate: self.sync_propagate.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached frame and the cursors of threads other than the caller
    pub fn clear(&self) {
        let mut state = self.state();
        state.lru.clear();
        let current = thread::current().id();
        state.cursors.retain(|id, _| *id == current);
        debug!("Lock {} cache cleared", self.uuid);
    }

    /// Threads holding a cursor
    pub fn cursor_count(&self) -> usize {
        self.state().cursors.len()
    }

    /// Number of cached frames
    pub fn cached(&self) -> usize {
        self.state().lru.len()
    }

    pub fn is_cached(&self, position: i32) -> bool {
        self.state().lru.contains(position)
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for Lock {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Lock
    }

    fn slot_count(&self) -> usize {
        1
    }

    fn connect(&self, source: SourceRef, slot: usize) -> GraphResult<()> {
        if slot != 0 {
            return Err(GraphError::InvalidSlot {
                stage: STAGE,
                slot,
                count: 1,
            });
        }
        let mut state = self.state();
        source.sync()?;
        state.frames = source.frames();
        state.upstream = Some(source);
        state.lru.clear();
        debug!("Lock {} connected ({} frames)", self.uuid, state.frames);
        Ok(())
    }

    fn input(&self, slot: usize) -> Option<SourceRef> {
        if slot == 0 { self.state().upstream.clone() } else { None }
    }

    /// Moves only the calling thread's cursor
    fn seek(&self, position: i32, relative: bool) {
        let mut state = self.state();
        let frames = state.frames;
        let cursor = state.cursors.entry(thread::current().id()).or_insert(0);
        let target = if relative { cursor.saturating_add(position) } else { position };
        *cursor = clamp_position(target, frames);
    }

    fn position(&self) -> i32 {
        self.state()
            .cursors
            .get(&thread::current().id())
            .copied()
            .unwrap_or(0)
    }

    fn frames(&self) -> i32 {
        self.state().frames
    }

    fn sync(&self) -> GraphResult<()> {
        let mut state = self.state();
        if self.sync_propagate.load(Ordering::Relaxed) {
            if let Some(upstream) = state.upstream.clone() {
                upstream.sync()?;
                state.frames = upstream.frames();
                trace!("Lock {} synced to {} frames", self.uuid, state.frames);
            }
        }
        Ok(())
    }

    fn fetch(&self) -> GraphResult<Option<Frame>> {
        let frame = {
            let mut state = self.state();
            let upstream = state
                .upstream
                .clone()
                .ok_or(GraphError::NotConnected { stage: STAGE, slot: 0 })?;
            let position = state.cursor();

            match state.lru.get(position) {
                Some(frame) => {
                    trace!("Lock {} hit at {}", self.uuid, position);
                    Some(frame)
                }
                None => {
                    upstream.seek(position, false);
                    match upstream.fetch()? {
                        Some(frame) => {
                            state.lru.insert(position, frame.clone());
                            Some(frame)
                        }
                        None => {
                            debug!("Lock {}: upstream produced nothing at {}", self.uuid, position);
                            None
                        }
                    }
                }
            }
        };

        Ok(frame.map(|mut frame| {
            if self.image.load(Ordering::Relaxed) {
                frame.make_image_writable();
            }
            frame
        }))
    }

    fn is_thread_safe(&self) -> bool {
        true
    }

    fn set_option(&self, key: &str, value: i64) -> GraphResult<()> {
        match key {
            O_QUEUE_SIZE if value >= 1 => {
                let mut state = self.state();
                state.queue_size = value as usize;
                let size = state.queue_size;
                state.lru.resize(size);
            }
            O_IMAGE => self.image.store(flag(value), Ordering::Relaxed),
            O_SYNC_PROPAGATE => self.sync_propagate.store(flag(value), Ordering::Relaxed),
            O_QUEUE_SIZE => {
                return Err(GraphError::InvalidOption {
                    stage: STAGE,
                    key: key.to_string(),
                    value,
                });
            }
            _ => {
                return Err(GraphError::UnknownOption {
                    stage: STAGE,
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn option(&self, key: &str) -> Option<i64> {
        match key {
            O_QUEUE_SIZE => Some(self.state().queue_size as i64),
            O_IMAGE => Some(self.image.load(Ordering::Relaxed) as i64),
            O_SYNC_PROPAGATE => Some(self.sync_propagate.load(Ordering::Relaxed) as i64),
            _ => None,
        }
    }

    fn option_keys(&self) -> &'static [&'static str] {
        &[O_QUEUE_SIZE, O_IMAGE, O_SYNC_PROPAGATE]
    }

    fn duplicate(&self, inputs: Vec<Option<SourceRef>>) -> GraphResult<SourceRef> {
        let mut lock = Lock::with_config(&self.config());
        lock.serialise_as = self.serialise_as;
        if let Some(Some(upstream)) = inputs.into_iter().next() {
            lock.connect(upstream, 0)?;
        }
        Ok(Arc::new(lock))
    }

    fn serialise_as(&self) -> Option<&'static str> {
        self.serialise_as
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability<'_>> {
        match kind {
            CapabilityKind::SyncControl => Some(Capability::SyncControl(self)),
            _ => None,
        }
    }
}

impl SyncControl for Lock {
    fn sync_propagate(&self) -> bool {
        self.sync_propagate.load(Ordering::Relaxed)
    }

    fn set_sync_propagate(&self, enabled: bool) {
        self.sync_propagate.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::nudger::Nudger;
    use crate::stages::pattern::{Pattern, PatternSpec};
    use std::sync::Barrier;

    fn pattern(frames: i32) -> Arc<Pattern> {
        Arc::new(Pattern::new(PatternSpec {
            frames,
            ..PatternSpec::default()
        }))
    }

    #[test]
    fn test_fetch_without_upstream_fails() {
        let lock = Lock::new();
        assert!(matches!(
            lock.fetch(),
            Err(GraphError::NotConnected { stage: "lock", slot: 0 })
        ));
    }

    #[test]
    fn test_connect_syncs_length() {
        let lock = Lock::new();
        lock.connect(pattern(42), 0).unwrap();
        assert_eq!(lock.frames(), 42);
        assert!(lock.connect(pattern(1), 1).is_err());
    }

    /// Test: Cursor independence
    /// Validates: T1.seek(p), T2.seek(q) leaves T1 at p
    #[test]
    fn test_cursor_per_thread() {
        let lock = Arc::new(Lock::new());
        lock.connect(pattern(100), 0).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [10, 70]
            .into_iter()
            .map(|mine| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    lock.seek(mine, false);
                    // Both threads have seeked past this point
                    barrier.wait();
                    let position = lock.position();
                    let frame = lock.fetch().unwrap().unwrap();
                    (position, frame.position())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![(10, 10), (70, 70)]);
        // Main thread was never seeked
        assert_eq!(lock.position(), 0);
    }

    #[test]
    fn test_clear_forgets_finished_threads() {
        let lock = Arc::new(Lock::new());
        lock.connect(pattern(100), 0).unwrap();
        lock.seek(42, false);
        for p in [1, 2, 3] {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.seek(p, false)).join().unwrap();
        }
        assert_eq!(lock.cursor_count(), 4);

        lock.clear();
        assert_eq!(lock.cursor_count(), 1);
        assert_eq!(lock.position(), 42);
    }

    #[test]
    fn test_relative_seek_clamps() {
        let lock = Lock::new();
        lock.connect(pattern(10), 0).unwrap();
        lock.seek(8, false);
        lock.seek(5, true);
        assert_eq!(lock.position(), 9);
        lock.seek(-20, true);
        assert_eq!(lock.position(), 0);
    }

    #[test]
    fn test_cache_avoids_upstream() {
        let source = pattern(100);
        let lock = Lock::new();
        lock.connect(source.clone(), 0).unwrap();

        let a = lock.fetch_at(5).unwrap().unwrap();
        let b = lock.fetch_at(5).unwrap().unwrap();
        assert_eq!(source.fetches(), 1);
        assert!(Arc::ptr_eq(&a.image().unwrap(), &b.image().unwrap()));
        assert!(lock.is_cached(5));
    }

    #[test]
    fn test_queue_size_bounds_cache() {
        let source = pattern(100);
        let lock = Lock::new();
        lock.connect(source.clone(), 0).unwrap();
        lock.set_option(O_QUEUE_SIZE, 2).unwrap();
        for p in 0..3 {
            lock.fetch_at(p).unwrap();
        }
        assert_eq!(lock.cached(), 2);
        assert!(!lock.is_cached(0));
        lock.fetch_at(0).unwrap();
        assert_eq!(source.fetches(), 4);
        assert!(lock.set_option(O_QUEUE_SIZE, 0).is_err());
        assert!(lock.set_option("bogus", 1).is_err());
    }

    #[test]
    fn test_image_option_returns_private_copy() {
        let lock = Lock::new();
        lock.connect(pattern(10), 0).unwrap();
        lock.set_option(O_IMAGE, 1).unwrap();
        let a = lock.fetch_at(1).unwrap().unwrap();
        let b = lock.fetch_at(1).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a.image().unwrap(), &b.image().unwrap()));
        assert_eq!(*a.image().unwrap(), *b.image().unwrap());
    }

    #[test]
    fn test_missing_frame_is_not_cached() {
        let nudger = Arc::new(Nudger::new());
        nudger.set_option(crate::entities::keys::O_TIMEOUT_MS, 1).unwrap();
        let lock = Lock::new();
        lock.connect(nudger, 0).unwrap();
        assert!(lock.fetch_at(3).unwrap().is_none());
        assert_eq!(lock.cached(), 0);
    }

    /// Test: sync_propagate=0 keeps the cached length
    #[test]
    fn test_sync_propagate_toggle() {
        let nudger = Arc::new(Nudger::new());
        nudger.set_option(crate::entities::keys::O_LENGTH, 10).unwrap();
        let lock = Lock::new();
        lock.connect(nudger.clone(), 0).unwrap();
        assert_eq!(lock.frames(), 10);

        nudger.set_option(crate::entities::keys::O_LENGTH, 20).unwrap();
        match lock.capability(CapabilityKind::SyncControl) {
            Some(Capability::SyncControl(control)) => control.set_sync_propagate(false),
            _ => panic!("lock must expose sync control"),
        }
        lock.sync().unwrap();
        assert_eq!(lock.frames(), 10);

        lock.set_option(O_SYNC_PROPAGATE, 1).unwrap();
        lock.sync().unwrap();
        assert_eq!(lock.frames(), 20);
    }

    #[test]
    fn test_duplicate_keeps_options() {
        let lock = Lock::new().with_serialise_as("nudger:");
        lock.set_option(O_QUEUE_SIZE, 7).unwrap();
        let copy = lock.duplicate(vec![Some(pattern(5) as SourceRef)]).unwrap();
        assert_eq!(copy.option(O_QUEUE_SIZE), Some(7));
        assert_eq!(copy.serialise_as(), Some("nudger:"));
        assert_eq!(copy.frames(), 5);
        assert_ne!(copy.uuid(), lock.uuid());
    }
}
