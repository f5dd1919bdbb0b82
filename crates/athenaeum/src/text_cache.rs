use std::num::NonZeroUsize;

use lru::LruCache;

pub const DEFAULT_CAPACITY: usize = 256;

/// Bounded LRU cache of decompressed volume texts, keyed by id. Evictions
/// are deterministic by least-recent-use.
#[derive(Debug)]
pub struct TextCache {
    inner: LruCache<String, String>,
}

impl TextCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, id: &str) -> Option<String> {
        self.inner.get(id).cloned()
    }

    pub fn put(&mut self, id: &str, text: String) {
        self.inner.put(id.to_string(), text);
    }

    pub fn invalidate(&mut self, id: &str) {
        self.inner.pop(id);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for TextCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
