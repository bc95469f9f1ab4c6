//! LRU Index
//!
//! Byte-weighted least-recently-used index shared by the Fast and Durable
//! tiers. Not synchronized: the owning tier wraps it in a lock so that
//! make-room and insert happen in one critical section.
//!
//! # Design
//!
//! - `HashMap` from key to (value, tick)
//! - `BTreeMap` from tick to key gives the recency order
//! - Every touch takes a fresh tick from a monotonic counter

use std::collections::{BTreeMap, HashMap};

/// Values that account for a number of bytes
pub(crate) trait Weighted {
    fn weight(&self) -> u64;
}

pub(crate) struct LruIndex<V> {
    map: HashMap<String, (V, u64)>,
    order: BTreeMap<u64, String>,
    tick: u64,
    used: u64,
}

impl<V> Default for LruIndex<V> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            used: 0,
        }
    }
}

impl<V: Weighted> LruIndex<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up and mark as most recently used
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let tick = self.next_tick();
        let (_, slot) = self.map.get_mut(key)?;
        let old = std::mem::replace(slot, tick);
        if let Some(k) = self.order.remove(&old) {
            self.order.insert(tick, k);
        }
        self.map.get(key).map(|(v, _)| v)
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &str) -> Option<&V> {
        self.map.get(key).map(|(v, _)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Insert as most recently used, returning the replaced value
    pub fn insert(&mut self, key: String, value: V) -> Option<V> {
        let old = self.remove(&key);
        let tick = self.next_tick();
        self.used += value.weight();
        self.order.insert(tick, key.clone());
        self.map.insert(key, (value, tick));
        old
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let (value, tick) = self.map.remove(key)?;
        self.order.remove(&tick);
        self.used = self.used.saturating_sub(value.weight());
        Some(value)
    }

    /// Remove the least recently used entry
    pub fn pop_lru(&mut self) -> Option<(String, V)> {
        let (_, key) = self.order.pop_first()?;
        let (value, _) = self.map.remove(&key)?;
        self.used = self.used.saturating_sub(value.weight());
        Some((key, value))
    }

    /// Evict LRU entries until `incoming` more bytes fit in `capacity`
    pub fn make_room(&mut self, incoming: u64, capacity: u64) -> Vec<(String, V)> {
        let mut evicted = Vec::new();
        while self.used.saturating_add(incoming) > capacity {
            match self.pop_lru() {
                Some(item) => evicted.push(item),
                None => break,
            }
        }
        evicted
    }

    /// Bytes accounted
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
        self.used = 0;
    }

    /// Keys from least to most recently used
    pub fn keys_lru_order(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values().map(|(v, _)| v)
    }
}
