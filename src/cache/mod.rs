use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Thread-safe LRU cache for query embeddings
///
/// Similarity queries for the same free-text string should not re-embed it;
/// LRU eviction keeps memory bounded.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// Create a new embedding cache with the specified capacity
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0 (LRU cache requires non-zero capacity)
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1))
            .expect("Cache capacity must be at least 1");

        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Get a cached embedding for a query
    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        self.cache
            .lock()
            .unwrap()
            .get(query)
            .cloned()
    }

    /// Store an embedding in the cache
    pub fn put(&self, query: String, embedding: Vec<f32>) {
        self.cache
            .lock()
            .unwrap()
            .put(query, embedding);
    }

    /// Get the current number of cached entries
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear()
    }
}
