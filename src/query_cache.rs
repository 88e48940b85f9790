use crate::retriever::ScoredChunk;
use crate::store::CommitHook;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry {
    results: Vec<ScoredChunk>,
    inserted: Instant,
    generation: u64,
}

/// LRU + TTL cache for retrieval results, invalidated by an index-generation
/// counter. The counter is owned here and bumped only through the commit hook
/// the index store is handed at wiring time, so any committed mutation makes
/// every older entry stale at once.
pub struct QueryCache {
    entries: RwLock<LruCache<[u8; 32], CacheEntry>>,
    ttl: Duration,
    generation: Arc<AtomicU64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
    pub generation: u64,
}

fn cache_key(query: &str, top_k: usize) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update((top_k as u16).to_be_bytes());
    hasher.finalize().into()
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            ttl,
            generation: Arc::new(AtomicU64::new(0)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Hook for the index store: bumps the generation on every committed
    /// mutation.
    pub fn commit_hook(&self) -> CommitHook {
        let generation = Arc::clone(&self.generation);
        Arc::new(move || {
            generation.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get(&self, query: &str, top_k: usize) -> Option<Vec<ScoredChunk>> {
        let key = cache_key(query, top_k);
        let current = self.generation();

        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        let valid = match entries.get(&key) {
            Some(entry) => entry.generation == current && entry.inserted.elapsed() <= self.ttl,
            None => false,
        };

        if valid {
            self.hits.fetch_add(1, Ordering::Relaxed);
            entries.get(&key).map(|e| e.results.clone())
        } else {
            entries.pop(&key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, query: &str, top_k: usize, results: Vec<ScoredChunk>) {
        let entry = CacheEntry {
            results,
            inserted: Instant::now(),
            generation: self.generation(),
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.put(cache_key(query, top_k), entry);
        }
    }

    /// Bump the generation and drop everything.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (len, capacity) = match self.entries.read() {
            Ok(entries) => (entries.len(), entries.cap().get()),
            Err(_) => (0, 0),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len,
            capacity,
            generation: self.generation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Chunk;

    fn result(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: id.to_string(),
                doc_id: "doc".to_string(),
                start_line: 1,
                end_line: 2,
                tokens: vec!["alpha".to_string()],
            },
            text: "alpha".to_string(),
            score,
        }
    }

    #[test]
    fn hit_returns_cached_results_until_ttl() {
        let cache = QueryCache::new(8, Duration::from_secs(60));
        cache.put("query", 5, vec![result("c1", 1.0)]);

        let hit = cache.get("query", 5).expect("fresh entry must hit");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].chunk.id, "c1");

        // a different top-k is a different key
        assert!(cache.get("query", 6).is_none());
        assert!(cache.get("other", 5).is_none());
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = QueryCache::new(8, Duration::from_secs(0));
        cache.put("query", 5, vec![result("c1", 1.0)]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("query", 5).is_none());
    }

    #[test]
    fn commit_hook_invalidates_older_entries() {
        let cache = QueryCache::new(8, Duration::from_secs(60));
        cache.put("query", 5, vec![result("c1", 1.0)]);
        assert!(cache.get("query", 5).is_some());

        let hook = cache.commit_hook();
        hook();
        assert!(cache.get("query", 5).is_none(), "stale generation must miss");

        // entries written after the bump are valid again
        cache.put("query", 5, vec![result("c2", 0.5)]);
        assert!(cache.get("query", 5).is_some());
    }

    #[test]
    fn invalidate_bumps_generation_and_clears() {
        let cache = QueryCache::new(8, Duration::from_secs(60));
        cache.put("query", 5, vec![result("c1", 1.0)]);
        let before = cache.generation();
        cache.invalidate();
        assert_eq!(cache.generation(), before + 1);
        assert_eq!(cache.stats().len, 0);
    }

    #[test]
    fn lru_evicts_least_recently_used_at_capacity() {
        let cache = QueryCache::new(2, Duration::from_secs(60));
        cache.put("a", 1, vec![result("a", 1.0)]);
        cache.put("b", 1, vec![result("b", 1.0)]);
        assert!(cache.get("a", 1).is_some()); // refresh "a"
        cache.put("c", 1, vec![result("c", 1.0)]);

        assert!(cache.get("a", 1).is_some());
        assert!(cache.get("b", 1).is_none(), "lru entry must be evicted");
        assert!(cache.get("c", 1).is_some());
    }
}
