// src/cache.rs

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    token: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Recency token -> key. The smallest token is the eviction candidate.
    recency: BTreeMap<u64, K>,
    next_token: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> Inner<K, V> {
    fn touch(&mut self, key: &K) -> Option<V> {
        let token = self.next_token;
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.token);
        entry.token = token;
        self.recency.insert(token, key.clone());
        self.next_token += 1;
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: K, value: V, capacity: usize) {
        let token = self.next_token;
        self.next_token += 1;
        if let Some(old) = self.entries.insert(key.clone(), Entry { value, token }) {
            self.recency.remove(&old.token);
        }
        self.recency.insert(token, key);
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.recency.pop_first() else { break };
            self.entries.remove(&oldest);
        }
    }
}

/// Bounded least-recently-used cache shared between request handlers.
///
/// Only the bookkeeping is locked. Values are computed outside the lock,
/// so concurrent misses on one key may both compute; the later insert wins.
/// A capacity of zero disables caching.
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_token: 0,
            }),
        }
    }

    /// Builds a cache from a configured capacity; zero or negative disables it.
    pub fn from_config(capacity: i64) -> Self {
        Self::new(usize::try_from(capacity).unwrap_or(0))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Returns the cached value and marks it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        self.inner.lock().touch(key)
    }

    pub fn insert(&self, key: K, value: V) {
        if self.is_enabled() {
            self.inner.lock().insert(key, value, self.capacity);
        }
    }

    pub fn get_or_compute<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but failed computations
    /// are not cached.
    pub fn try_get_or_compute<E, F>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Async variant for computations that run an external probe. Failed
    /// computations are not cached.
    pub async fn get_or_compute_async<E, F, Fut>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = compute().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Drops one entry, e.g. after its source file changed.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(key)?;
        inner.recency.remove(&entry.token);
        Some(entry.value)
    }

    /// Keeps only the entries matching `keep`.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut inner = self.inner.lock();
        let Inner { entries, recency, .. } = &mut *inner;
        entries.retain(|key, entry| {
            let kept = keep(key, &entry.value);
            if !kept {
                recency.remove(&entry.token);
            }
            kept
        });
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn overflow_evicts_least_recently_used() {
        let cache = LruCache::new(3);
        for key in ["a", "b", "c", "d"] {
            cache.get_or_compute(key, || key.len());
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b") && cache.contains(&"c") && cache.contains(&"d"));
    }

    #[test]
    fn reading_a_key_protects_it_from_eviction() {
        let cache = LruCache::new(3);
        for key in ["a", "b", "c"] {
            cache.insert(key, 0);
        }
        assert_eq!(cache.get(&"a"), Some(0));
        cache.insert("d", 0);
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
    }

    #[test]
    fn hit_does_not_recompute() {
        let cache = LruCache::new(2);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache.get_or_compute(1, || {
                calls.fetch_add(1, Ordering::SeqCst);
                "x"
            });
            assert_eq!(v, "x");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_or_negative_capacity_disables_caching() {
        for capacity in [0, -5] {
            let cache = LruCache::from_config(capacity);
            let calls = AtomicUsize::new(0);
            for _ in 0..3 {
                cache.get_or_compute("k", || calls.fetch_add(1, Ordering::SeqCst));
            }
            assert_eq!(calls.load(Ordering::SeqCst), 3);
            assert!(cache.is_empty());
        }
    }

    #[test]
    fn errors_are_not_cached() {
        let cache: LruCache<&str, u32> = LruCache::new(4);
        let failed: Result<u32, &str> = cache.try_get_or_compute("k", || Err("probe failed"));
        assert!(failed.is_err());
        assert!(!cache.contains(&"k"));
        assert_eq!(cache.try_get_or_compute::<&str, _>("k", || Ok(5)), Ok(5));
    }

    #[test]
    fn invalidate_and_retain_keep_order_consistent() {
        let cache = LruCache::new(3);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(3, "three");
        assert_eq!(cache.invalidate(&1), Some("one"));
        cache.retain(|k, _| *k != 2);
        cache.insert(4, "four");
        cache.insert(5, "five");
        assert_eq!(cache.len(), 3);
        cache.insert(6, "six");
        assert!(!cache.contains(&3));
        assert!(cache.contains(&6));
    }

    #[test]
    fn concurrent_callers_stay_within_capacity() {
        let cache = Arc::new(LruCache::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = (i * 7 + t) % 40;
                        assert_eq!(cache.get_or_compute(key, || key * 2), key * 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }

    #[tokio::test]
    async fn async_compute_is_cached() {
        let cache = LruCache::new(2);
        let first: Result<_, std::io::Error> = cache.get_or_compute_async("a", || async { Ok(1) }).await;
        assert_eq!(first.unwrap(), 1);
        let second: Result<_, std::io::Error> = cache.get_or_compute_async("a", || async { Ok(2) }).await;
        assert_eq!(second.unwrap(), 1);
    }
}
