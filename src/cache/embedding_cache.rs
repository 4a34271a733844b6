use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use crate::error::Result;

/// Thread-safe LRU cache of query vectors
///
/// Keys are queries with surrounding whitespace trimmed and inner runs of
/// whitespace collapsed, so trivially different spellings share an entry.
pub struct QueryVectorCache {
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

fn cache_key(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl QueryVectorCache {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key(query))
            .cloned()
    }

    pub fn put(&self, query: &str, vector: Vec<f32>) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(cache_key(query), vector);
    }

    /// Cached vector for `query`, computing and storing it on a miss.
    ///
    /// The lock is not held while `compute` runs; concurrent misses for the
    /// same query may both compute.
    pub fn get_or_compute<F>(&self, query: &str, compute: F) -> Result<Vec<f32>>
    where
        F: FnOnce() -> Result<Vec<f32>>,
    {
        if let Some(hit) = self.get(query) {
            log::debug!("Query vector cache hit: {}", query);
            return Ok(hit);
        }
        let vector = compute()?;
        self.put(query, vector.clone());
        Ok(vector)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KbError;
    use std::cell::Cell;

    #[test]
    fn test_whitespace_variants_share_entry() {
        let cache = QueryVectorCache::new(10);
        cache.put("storage  engine ", vec![1.0, 2.0]);

        assert_eq!(cache.get(" storage engine"), Some(vec![1.0, 2.0]));
        assert!(cache.get("storage").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_compute_calls_once() {
        let cache = QueryVectorCache::new(4);
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok(vec![0.5])
        };

        assert_eq!(cache.get_or_compute("q", compute).unwrap(), vec![0.5]);
        assert_eq!(cache.get_or_compute("q", compute).unwrap(), vec![0.5]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_compute_error_not_cached() {
        let cache = QueryVectorCache::new(4);
        let result = cache.get_or_compute("q", || Err(KbError::Embedding("offline".into())));

        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_follows_recent_use() {
        let cache = QueryVectorCache::new(2);
        cache.put("query1", vec![1.0]);
        cache.put("query2", vec![2.0]);
        let _ = cache.get("query1");
        cache.put("query3", vec![3.0]);

        assert!(cache.get("query1").is_some());
        assert!(cache.get("query2").is_none());

        cache.clear();
        assert!(cache.is_empty());
    }
}
