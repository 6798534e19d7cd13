//! In-memory LRU caches with size gauge emission.
//!
//! The LRU itself is a hash map plus an order log: each access appends a
//! fresh `(key, seq)` entry and stamps the live slot with the same sequence
//! number, so only the newest log entry for a key is authoritative. Eviction
//! pops stale log entries until it finds a live one; the log is compacted
//! once its slack exceeds the live size. All operations are amortized O(1).

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Mutex;

/// Order-log slack beyond which a compaction pass runs.
const COMPACT_SLACK: usize = 64;

pub struct LruCache<K, V> {
    map: HashMap<K, Slot<V>>,
    order: VecDeque<(K, u64)>,
    seq: u64,
    capacity: usize,
}

struct Slot<V> {
    value: V,
    seq: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Looks up a key, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.seq += 1;
        let seq = self.seq;
        self.order.push_back((key.clone(), seq));
        self.maybe_compact();
        let slot = self.map.get_mut(key)?;
        slot.seq = seq;
        Some(&slot.value)
    }

    /// Inserts or replaces a value, evicting the least-recently-used entry
    /// on overflow.
    pub fn insert(&mut self, key: K, value: V) {
        self.seq += 1;
        let seq = self.seq;
        self.order.push_back((key.clone(), seq));
        self.map.insert(key, Slot { value, seq });
        if self.map.len() > self.capacity {
            self.evict_lru();
        }
        self.maybe_compact();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|slot| slot.value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_lru(&mut self) {
        while let Some((key, seq)) = self.order.pop_front() {
            let live = self.map.get(&key).is_some_and(|slot| slot.seq == seq);
            if live {
                self.map.remove(&key);
                return;
            }
        }
    }

    fn maybe_compact(&mut self) {
        if self.order.len() <= 2 * self.map.len() + COMPACT_SLACK {
            return;
        }
        let map = &self.map;
        self.order
            .retain(|(key, seq)| map.get(key).is_some_and(|slot| slot.seq == *seq));
    }
}

/// A named, mutex-guarded LRU keyed by player file path. Every mutation
/// publishes the resulting size to the `cache_size` gauge.
pub struct MeteredCache<V> {
    name: &'static str,
    inner: Mutex<LruCache<PathBuf, V>>,
}

impl<V: Clone> MeteredCache<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &PathBuf) -> Option<V> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: PathBuf, value: V) {
        let mut cache = self.inner.lock().unwrap();
        cache.insert(key, value);
        ytcipher_metrics::set_cache_size(self.name, cache.len());
    }

    pub fn remove(&self, key: &PathBuf) {
        let mut cache = self.inner.lock().unwrap();
        cache.remove(key);
        ytcipher_metrics::set_cache_size(self.name, cache.len());
    }

    pub fn clear(&self) {
        let mut cache = self.inner.lock().unwrap();
        cache.clear();
        ytcipher_metrics::set_cache_size(self.name, cache.len());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
