//! Named registry of position-indexed caches
//!
//! Structure: HashMap<String, Arc<ScopeCache>>
//! - Outer map: scope name -> cache
//! - Each scope: position -> {frame, image, audio}, one LRU order
//!
//! Scopes are created explicitly by the stage that owns them and looked up by
//! name; a lookup never creates. Each scope locks itself, so holders of an
//! `Arc<ScopeCache>` never contend on the registry lock.

use log::debug;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::entities::{Audio, Frame, Image};
use crate::error::RegistryError;

/// Default capacity of a new scope
pub const DEFAULT_SCOPE_CAPACITY: usize = 32;

/// Cache statistics for monitoring performance
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Payloads cached for one position
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub frame: Option<Frame>,
    pub image: Option<Arc<Image>>,
    pub audio: Option<Arc<Audio>>,
}

/// One scope: self-locking LRU of entries by position
#[derive(Debug)]
pub struct ScopeCache {
    name: String,
    lru: Mutex<LruCache<i32, CacheEntry>>,
    stats: CacheStats,
}

impl ScopeCache {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            lru: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))),
            stats: CacheStats::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.lru.lock().unwrap_or_else(|e| e.into_inner()).cap().get()
    }

    pub fn resize(&self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let mut lru = self.lru.lock().unwrap_or_else(|e| e.into_inner());
        if lru.cap() != capacity {
            debug!("Scope '{}' resized {} -> {}", self.name, lru.cap(), capacity);
            lru.resize(capacity);
        }
    }

    fn update(&self, position: i32, apply: impl FnOnce(&mut CacheEntry)) {
        let mut lru = self.lru.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = lru.get_mut(&position) {
            apply(entry);
        } else {
            let mut entry = CacheEntry::default();
            apply(&mut entry);
            lru.push(position, entry);
        }
    }

    fn lookup<T>(&self, position: i32, pick: impl FnOnce(&CacheEntry) -> Option<T>) -> Option<T> {
        let result = {
            let mut lru = self.lru.lock().unwrap_or_else(|e| e.into_inner());
            lru.get(&position).and_then(pick)
        };
        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    pub fn insert_frame(&self, position: i32, frame: Frame) {
        self.update(position, |entry| entry.frame = Some(frame));
    }

    pub fn insert_image(&self, position: i32, image: Arc<Image>) {
        self.update(position, |entry| entry.image = Some(image));
    }

    pub fn insert_audio(&self, position: i32, audio: Arc<Audio>) {
        self.update(position, |entry| entry.audio = Some(audio));
    }

    /// Clone of the cached frame (counts as a hit or a miss)
    pub fn frame(&self, position: i32) -> Option<Frame> {
        self.lookup(position, |entry| entry.frame.clone())
    }

    pub fn image(&self, position: i32) -> Option<Arc<Image>> {
        self.lookup(position, |entry| entry.image.clone())
    }

    pub fn audio(&self, position: i32) -> Option<Arc<Audio>> {
        self.lookup(position, |entry| entry.audio.clone())
    }

    /// Check without touching the LRU order or the statistics
    pub fn contains(&self, position: i32) -> bool {
        self.lru.lock().unwrap_or_else(|e| e.into_inner()).contains(&position)
    }

    pub fn remove(&self, position: i32) -> Option<CacheEntry> {
        self.lru.lock().unwrap_or_else(|e| e.into_inner()).pop(&position)
    }

    pub fn clear(&self) {
        self.lru.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!("Cleared scope '{}'", self.name);
    }

    pub fn len(&self) -> usize {
        self.lru.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Registry of named scopes, shared as `Arc<CacheRegistry>`
#[derive(Debug, Default)]
pub struct CacheRegistry {
    scopes: RwLock<HashMap<String, Arc<ScopeCache>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope with the default capacity; fails if it exists
    pub fn create(&self, scope: &str) -> Result<Arc<ScopeCache>, RegistryError> {
        self.create_with_capacity(scope, DEFAULT_SCOPE_CAPACITY)
    }

    pub fn create_with_capacity(&self, scope: &str, capacity: usize) -> Result<Arc<ScopeCache>, RegistryError> {
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        if scopes.contains_key(scope) {
            return Err(RegistryError::ScopeExists(scope.to_string()));
        }
        let cache = Arc::new(ScopeCache::new(scope, capacity));
        scopes.insert(scope.to_string(), Arc::clone(&cache));
        debug!("Created cache scope '{}' (capacity {})", scope, capacity);
        Ok(cache)
    }

    /// Existing scope; fails if it was never created
    pub fn lookup(&self, scope: &str) -> Result<Arc<ScopeCache>, RegistryError> {
        self.scopes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownScope(scope.to_string()))
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.read().unwrap_or_else(|e| e.into_inner()).contains_key(scope)
    }

    /// Drop a scope; outstanding `Arc<ScopeCache>` handles stay valid
    pub fn remove(&self, scope: &str) -> Result<(), RegistryError> {
        match self.scopes.write().unwrap_or_else(|e| e.into_inner()).remove(scope) {
            Some(_) => {
                debug!("Removed cache scope '{}'", scope);
                Ok(())
            }
            None => Err(RegistryError::UnknownScope(scope.to_string())),
        }
    }

    /// Scope names, sorted
    pub fn scopes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .scopes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.scopes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every scope
    pub fn teardown(&self) {
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        debug!("Cache registry teardown ({} scopes)", scopes.len());
        scopes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{PixelFormat, Rational};

    /// Test: Scope registry exclusivity
    /// Validates: double create fails, lookup never creates
    #[test]
    fn test_scope_exclusivity() {
        let registry = CacheRegistry::new();
        registry.create("x").unwrap();
        assert_eq!(registry.create("x").unwrap_err(), RegistryError::ScopeExists("x".into()));
        assert_eq!(registry.lookup("y").unwrap_err(), RegistryError::UnknownScope("y".into()));
        assert!(!registry.contains("y"));
    }

    #[test]
    fn test_lookup_shares_scope() {
        let registry = CacheRegistry::new();
        let created = registry.create("shared").unwrap();
        created.insert_frame(3, Frame::new(3, Rational::default()));

        let found = registry.lookup("shared").unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert_eq!(found.frame(3).map(|f| f.position()), Some(3));
        assert_eq!(found.capacity(), DEFAULT_SCOPE_CAPACITY);
    }

    #[test]
    fn test_scopes_are_independent() {
        let registry = CacheRegistry::new();
        let a = registry.create("a").unwrap();
        let b = registry.create("b").unwrap();
        a.insert_frame(0, Frame::new(0, Rational::default()));
        assert!(a.contains(0));
        assert!(!b.contains(0));
        assert_eq!(registry.scopes(), vec!["a".to_string(), "b".to_string()]);
    }

    /// Test: One eviction order across frame, image and audio
    #[test]
    fn test_entry_payloads_share_eviction() {
        let registry = CacheRegistry::new();
        let scope = registry.create_with_capacity("mixed", 2).unwrap();
        scope.insert_image(0, Arc::new(Image::new(2, 2, PixelFormat::Gray8)));
        scope.insert_audio(0, Arc::new(Audio::new(48000, 2, 1920)));
        scope.insert_frame(1, Frame::new(1, Rational::default()));
        assert_eq!(scope.len(), 2);

        scope.insert_audio(2, Arc::new(Audio::new(48000, 2, 1920)));
        assert!(!scope.contains(0));
        assert!(scope.image(0).is_none());
        assert!(scope.audio(2).is_some());
    }

    #[test]
    fn test_stats_and_remove() {
        let registry = CacheRegistry::new();
        let scope = registry.create("stats").unwrap();
        scope.insert_frame(1, Frame::new(1, Rational::default()));
        assert!(scope.frame(1).is_some());
        assert!(scope.frame(2).is_none());
        assert_eq!(scope.stats().hits(), 1);
        assert_eq!(scope.stats().misses(), 1);
        assert_eq!(scope.stats().hit_rate(), 0.5);

        registry.remove("stats").unwrap();
        assert!(registry.lookup("stats").is_err());
        assert!(registry.remove("stats").is_err());
        // Handle outlives the registry entry
        assert!(scope.frame(1).is_some());
        // Name is free again
        registry.create("stats").unwrap();
    }

    #[test]
    fn test_teardown_releases_all() {
        let registry = CacheRegistry::new();
        registry.create("a").unwrap();
        registry.create("b").unwrap();
        registry.teardown();
        assert!(registry.is_empty());
    }
}
