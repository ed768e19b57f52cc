//! Position-keyed frame LRU
//!
//! Two flavours:
//! - [`FrameLru`] - plain cache, protected by its owner's lock (Lock stage)
//! - [`BlockingLru`] - self-locking, with a bounded wait for a position to
//!   arrive (Nudger)
//!
//! Keys are absolute pipeline positions. Lookups hand out clones, so an
//! eviction never invalidates a frame a caller already holds.

use log::trace;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::entities::Frame;

fn capacity_of(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

/// Bounded LRU of frames by position
#[derive(Debug)]
pub struct FrameLru {
    cache: LruCache<i32, Frame>,
}

impl FrameLru {
    /// Capacity 0 is treated as 1
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(capacity_of(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Change capacity, evicting least recently used entries if shrinking
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity_of(capacity);
        if capacity != self.cache.cap() {
            trace!("FrameLru resize {} -> {}", self.cache.cap(), capacity);
            self.cache.resize(capacity);
        }
    }

    /// Clone of the frame at `position`, marking it most recently used
    pub fn get(&mut self, position: i32) -> Option<Frame> {
        self.cache.get(&position).cloned()
    }

    /// Check without touching the LRU order
    pub fn contains(&self, position: i32) -> bool {
        self.cache.contains(&position)
    }

    /// Insert or refresh; returns the evicted position, if any
    pub fn insert(&mut self, position: i32, frame: Frame) -> Option<i32> {
        match self.cache.push(position, frame) {
            Some((evicted, _)) if evicted != position => Some(evicted),
            _ => None,
        }
    }

    pub fn remove(&mut self, position: i32) -> Option<Frame> {
        self.cache.pop(&position)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Cached positions, most recently used first
    pub fn positions(&self) -> Vec<i32> {
        self.cache.iter().map(|(position, _)| *position).collect()
    }
}

/// Self-locking [`FrameLru`] with a blocking wait
#[derive(Debug)]
pub struct BlockingLru {
    inner: Mutex<FrameLru>,
    arrived: Condvar,
}

impl BlockingLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FrameLru::new(capacity)),
            arrived: Condvar::new(),
        }
    }

    pub fn resize(&self, capacity: usize) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).resize(capacity);
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).capacity()
    }

    /// Insert and wake every waiter
    pub fn insert(&self, position: i32, frame: Frame) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).insert(position, frame);
        self.arrived.notify_all();
    }

    pub fn get(&self, position: i32) -> Option<Frame> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(position)
    }

    pub fn contains(&self, position: i32) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).contains(position)
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until `position` is cached or `timeout` elapses
    pub fn wait(&self, position: i32, timeout: Duration) -> Option<Frame> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, result) = self
            .arrived
            .wait_timeout_while(guard, timeout, |lru| !lru.contains(position))
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() && !guard.contains(position) {
            trace!("BlockingLru wait for {} timed out after {:?}", position, timeout);
            return None;
        }
        guard.get(position)
    }
}
