//! In-memory result cache with LRU eviction by entry count.

use super::image::{Fingerprint, Image};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::trace;

/// Entry in the result cache.
#[derive(Debug, Clone)]
struct CacheEntry {
    image: Image,
    /// Logical access clock; the smallest value is least recently used.
    tick: u64,
    last_access: Instant,
}

struct CacheInner {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Access order: tick → fingerprint.
    order: BTreeMap<u64, Fingerprint>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Content-addressed cache of processed images.
///
/// A single lock covers lookup, access-order update and eviction, so reads
/// and writes for a key are linearizable. A capacity of zero disables
/// caching.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity,
        }
    }

    /// Looks up a result and marks it most recently used.
    pub fn get(&self, key: &Fingerprint) -> Option<Image> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let inner = &mut *inner;

        match inner.entries.get_mut(key) {
            Some(entry) => {
                inner.order.remove(&entry.tick);
                entry.tick = tick;
                entry.last_access = Instant::now();
                inner.order.insert(tick, *key);
                inner.hits += 1;
                Some(entry.image.clone())
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Stores a result, evicting least recently used entries over capacity.
    pub fn insert(&self, key: Fingerprint, image: Image) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        if let Some(old) = inner.entries.insert(
            key,
            CacheEntry {
                image,
                tick,
                last_access: Instant::now(),
            },
        ) {
            inner.order.remove(&old.tick);
        }
        inner.order.insert(tick, key);

        while inner.entries.len() > self.capacity {
            let Some((_, victim)) = inner.order.pop_first() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.evictions += 1;
                trace!(
                    fingerprint = ?victim,
                    idle_ms = evicted.last_access.elapsed().as_millis() as u64,
                    "Evicted cached result"
                );
            }
        }
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::image::Operation;
    use std::sync::Arc;

    fn key(n: u8) -> (Fingerprint, Image) {
        let image = Image::new(format!("img-{n}"), vec![n]);
        let fp = Fingerprint::compute(&image, &[Operation::new("noop")]).unwrap();
        (fp, image)
    }

    #[test]
    fn test_get_and_insert() {
        let cache = ResultCache::new(4);
        let (k, img) = key(1);

        assert!(cache.get(&k).is_none());
        cache.insert(k, img.clone());
        assert_eq!(cache.get(&k), Some(img));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = ResultCache::new(2);
        let (k1, i1) = key(1);
        let (k2, i2) = key(2);
        let (k3, i3) = key(3);

        cache.insert(k1, i1);
        cache.insert(k2, i2);
        // Touch k1 so k2 becomes least recently used
        assert!(cache.get(&k1).is_some());
        cache.insert(k3, i3);

        assert!(cache.contains(&k1));
        assert!(!cache.contains(&k2));
        assert!(cache.contains(&k3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_reinsert_same_key_does_not_grow() {
        let cache = ResultCache::new(2);
        let (k1, i1) = key(1);
        cache.insert(k1, i1.clone());
        cache.insert(k1, i1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let cache = ResultCache::new(0);
        let (k1, i1) = key(1);
        cache.insert(k1, i1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = ResultCache::new(4);
        let (k1, i1) = key(1);
        cache.insert(k1, i1);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&k1).is_none());
    }

    #[test]
    fn test_concurrent_access_respects_capacity() {
        let cache = Arc::new(ResultCache::new(8));
        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        let (k, img) = key(t.wrapping_mul(50).wrapping_add(i));
                        cache.insert(k, img);
                        let _ = cache.get(&k);
                        assert!(cache.len() <= 8);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(cache.len(), 8);
    }
}
