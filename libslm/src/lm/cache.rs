use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::FxHashMap;

/// Insertion-ordered probability cache: overflowing drops the eldest entry.
/// Lookups do not reorder entries, so two engines fed the same query stream
/// keep identical cache contents.
pub(crate) struct LruCache<K, V> {
    map: FxHashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Copy + Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> LruCache<K, V> {
        LruCache {
            map: FxHashMap::default(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn put(&mut self, key: K, value: V) {
        if self.map.insert(key, value).is_none() {
            self.order.push_back(key);
            if self.map.len() > self.capacity {
                if let Some(eldest) = self.order.pop_front() {
                    self.map.remove(&eldest);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}
