//! Upscaled-result cache keyed by image identity and settings.
//!
//! Unbounded by default. With a capacity, the least-recently-used entry is
//! evicted on insert once the capacity is exceeded. Every [`ResultCache::clear`]
//! starts a new generation; results computed against an older generation are
//! not stored.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::bitmap::Bitmap;
use crate::settings::UpscaleSettings;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    identity: Arc<str>,
    settings: UpscaleSettings,
}

impl CacheKey {
    pub fn new(image: &Bitmap, settings: UpscaleSettings) -> Self {
        Self {
            identity: Arc::from(image.identity()),
            settings,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn settings(&self) -> UpscaleSettings {
        self.settings
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.identity, self.settings.model_stem())
    }
}

struct CacheEntry {
    bitmap: Bitmap,
    last_used: AtomicU64,
}

pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    /// 0 means unbounded.
    max_entries: usize,
    clock: AtomicU64,
    generation: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            clock: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Bitmap> {
        let entry = self.entries.get(key)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(entry.bitmap.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&self, key: CacheKey, bitmap: Bitmap) {
        let entry = CacheEntry {
            bitmap,
            last_used: AtomicU64::new(self.tick()),
        };
        self.entries.insert(key, entry);

        if self.max_entries > 0 {
            self.evict_over_capacity();
        }
    }

    /// Stores `bitmap` unless the cache was cleared after `generation` was read.
    pub fn insert_if_current(&self, key: CacheKey, bitmap: Bitmap, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.insert(key.clone(), bitmap.clone());

        // A clear that raced the insert above.
        if self.generation() != generation {
            self.entries
                .remove_if(&key, |_, entry| entry.bitmap.ptr_eq(&bitmap));
            return false;
        }
        true
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn evict_over_capacity(&self) {
        while self.entries.len() > self.max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());
            let Some(key) = victim else {
                break;
            };
            self.entries.remove(&key);
            debug!(key = %key, max_entries = self.max_entries, "Evicted cached result");
        }
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}
