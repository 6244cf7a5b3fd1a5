//! Capacity-bounded LRU cache and a write-back wrap around a backing
//! store, ported from `pyetlmr.lrustore`'s `lrucache` and `LRUWrap`.
//!
//! The source keeps every slot materialized via an intrusive doubly
//! linked list; that is an artifact of its hand-rolled node table, not
//! part of the externally observable contract. This port gets the same
//! eviction-order and callback guarantees from a `HashMap` plus an
//! ordered index list, without pre-allocating empty slots.

use std::collections::HashMap;
use std::hash::Hash;

/// An LRU cache of fixed `capacity`. When a new key would exceed
/// capacity, the least-recently-touched entry is evicted and handed to
/// an optional callback before being dropped.
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    /// Most-recently-used at the back.
    order: Vec<K>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU cache capacity must be positive");
        LruCache {
            capacity,
            map: HashMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    /// Returns the value without changing recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Returns the value, moving `key` to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.touch(key);
            self.map.get(key)
        } else {
            None
        }
    }

    /// Inserts or overwrites `key`. If this would exceed capacity, evicts
    /// the least-recently-used entry first, invoking `on_evict`.
    pub fn insert(&mut self, key: K, value: V, mut on_evict: impl FnMut(K, V)) {
        if self.map.contains_key(&key) {
            self.map.insert(key.clone(), value);
            self.touch(&key);
            return;
        }
        if self.map.len() >= self.capacity {
            if let Some(evicted_key) = self.order.first().cloned() {
                self.order.remove(0);
                if let Some(evicted_val) = self.map.remove(&evicted_key) {
                    on_evict(evicted_key, evicted_val);
                }
            }
        }
        self.order.push(key.clone());
        self.map.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.map.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }
}

/// Write-back wrap around a persistent backing store, ported from
/// `pyetlmr.lrustore.LRUWrap`. Reads fall through to `load` on a cache
/// miss; writes stay in the cache and are marked dirty until `sync`
/// (or eviction) writes them through via `store_fn`.
pub struct LruWrap<K, V> {
    cache: LruCache<K, V>,
    dirty: std::collections::HashSet<K>,
    readonly: bool,
}

/// Key under which the next-surrogate-key counter is kept, mirroring
/// `pyetlmr.lrustore.SEQ`.
pub const SEQ_KEY: &str = "seq";

impl<K, V> LruWrap<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(capacity: usize, readonly: bool) -> Self {
        LruWrap {
            cache: LruCache::new(capacity),
            dirty: std::collections::HashSet::new(),
            readonly,
        }
    }

    /// Reads through to the store on a cache miss. `load` is given the
    /// key and returns the stored value, if any.
    pub fn get(&mut self, key: &K, load: impl FnOnce(&K) -> Option<V>) -> Option<V> {
        if let Some(v) = self.cache.get(key) {
            return Some(v.clone());
        }
        let loaded = load(key)?;
        self.cache.insert(key.clone(), loaded.clone(), |_, _| {});
        Some(loaded)
    }

    /// Writes `value` into the cache and marks it dirty. Evicting a
    /// dirty entry writes it through via `store`.
    pub fn put(&mut self, key: K, value: V, mut store: impl FnMut(&K, &V)) -> crate::error::Result<()> {
        if self.readonly {
            return Err(crate::error::EtlError::ReadonlyViolation);
        }
        let dirty = &mut self.dirty;
        self.cache.insert(key.clone(), value, |ek, ev| {
            if dirty.remove(&ek) {
                store(&ek, &ev);
            }
        });
        self.dirty.insert(key);
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.dirty.remove(key);
        self.cache.remove(key)
    }

    /// Writes every dirty entry through to the store, in cache order,
    /// then clears the dirty set.
    pub fn sync(&mut self, mut store: impl FnMut(&K, &V)) {
        for key in self.dirty.drain().collect::<Vec<_>>() {
            if let Some(value) = self.cache.peek(&key) {
                store(&key, value);
            }
        }
    }
}

impl LruWrap<String, i64> {
    /// Atomic next-integer generator over the reserved `seq` entry,
    /// mirroring `LRUWrap.incr`: read the current value from cache, else
    /// from the store, else `default`; write back `value + 1`.
    pub fn incr(
        &mut self,
        default: i64,
        load: impl FnOnce(&String) -> Option<i64>,
        store: impl FnMut(&String, &i64),
    ) -> crate::error::Result<i64> {
        if self.readonly {
            return Err(crate::error::EtlError::ReadonlyViolation);
        }
        let key = SEQ_KEY.to_string();
        let current = self.get(&key, load).unwrap_or(default);
        self.put(key, current + 1, store)?;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut evicted = Vec::new();
        let mut cache = LruCache::new(2);
        cache.insert(1, "a", |k, v| evicted.push((k, v)));
        cache.insert(2, "b", |k, v| evicted.push((k, v)));
        cache.get(&1);
        cache.insert(3, "c", |k, v| evicted.push((k, v)));
        assert_eq!(evicted, vec![(2, "b")]);
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
    }

    #[test]
    fn sync_flushes_dirty_entries_in_order() {
        let mut wrap: LruWrap<String, i64> = LruWrap::new(10, false);
        let mut written = Vec::new();
        wrap.put("a".into(), 1, |_, _| {}).unwrap();
        wrap.put("b".into(), 2, |_, _| {}).unwrap();
        wrap.sync(|k, v| written.push((k.clone(), *v)));
        written.sort();
        assert_eq!(written, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }

    #[test]
    fn incr_starts_from_default_and_increments() {
        let store = std::cell::RefCell::new(std::collections::HashMap::<String, i64>::new());
        let mut wrap: LruWrap<String, i64> = LruWrap::new(10, false);
        let first = wrap
            .incr(1, |k| store.borrow().get(k).copied(), |k, v| { store.borrow_mut().insert(k.clone(), *v); })
            .unwrap();
        assert_eq!(first, 1);
        wrap.sync(|k, v| { store.borrow_mut().insert(k.clone(), *v); });
        let second = wrap
            .incr(1, |k| store.borrow().get(k).copied(), |k, v| { store.borrow_mut().insert(k.clone(), *v); })
            .unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn readonly_rejects_writes() {
        let mut wrap: LruWrap<String, i64> = LruWrap::new(10, true);
        assert!(wrap.put("a".into(), 1, |_, _| {}).is_err());
    }
}
