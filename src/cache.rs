use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bounded LRU cache for query embeddings.
///
/// Keys are the SHA-256 digest of the query text. `get` promotes the entry
/// to most-recently-used; `put` evicts the least-recently-used entry when
/// the cache is full. All operations take one short critical section, so
/// the cache is safe to share across concurrent requests.
pub struct EmbeddingCache {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<[u8; 32], Vec<f32>>,
    hits: u64,
    misses: u64,
}

fn key(text: &str) -> [u8; 32] {
    Sha256::digest(text.as_bytes()).into()
}

impl EmbeddingCache {
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().expect("embedding cache lock poisoned");
        match inner.entries.get(&key(text)) {
            Some(vector) => {
                let vector = vector.clone();
                inner.hits += 1;
                Some(vector)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert (or promote) an embedding for `text`.
    pub fn put(&self, text: &str, embedding: Vec<f32>) {
        let mut inner = self.inner.lock().expect("embedding cache lock poisoned");
        inner.entries.put(key(text), embedding);
    }

    pub fn hits(&self) -> u64 {
        self.inner.lock().expect("embedding cache lock poisoned").hits
    }

    pub fn misses(&self) -> u64 {
        self.inner.lock().expect("embedding cache lock poisoned").misses
    }

    /// `hits / (hits + misses)`; zero when nothing was looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let inner = self.inner.lock().expect("embedding cache lock poisoned");
        let total = inner.hits + inner.misses;
        if total == 0 {
            0.0
        } else {
            inner.hits as f64 / total as f64
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("embedding cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("embedding cache lock poisoned");
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }
}
