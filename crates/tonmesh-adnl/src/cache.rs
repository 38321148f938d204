//! Bounded maps with idle expiry
//!
//! Entries expire once they have not been read or written for `ttl`. When
//! the map is full, expired entries are purged first and then the least
//! recently touched entry is evicted. Per-key operations lock only the
//! shard holding the key.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Slot<V> {
    value: V,
    touched: Instant,
}

impl<V> Slot<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            touched: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.touched.elapsed() > ttl
    }
}

/// Concurrent map with a size bound and idle expiry
pub struct TtlCache<K, V> {
    entries: DashMap<K, Slot<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Look up and touch an entry
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get_mut(key) {
            None => return None,
            Some(mut slot) => {
                if slot.is_expired(self.ttl) {
                    true
                } else {
                    slot.touched = Instant::now();
                    return Some(slot.value.clone());
                }
            }
        };
        if expired {
            self.entries.remove_if(key, |_, slot| slot.is_expired(self.ttl));
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace an entry
    pub fn insert(&self, key: K, value: V) {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(key, Slot::new(value));
    }

    /// Return the live entry for `key`, creating it with `make` if absent
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        self.make_room();
        let mut slot = self.entries.entry(key).or_insert_with(|| Slot::new(make()));
        slot.touched = Instant::now();
        slot.value.clone()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, slot)| slot.value)
    }

    /// Remove `key` only if `predicate` holds for its value
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.entries
            .remove_if(key, |_, slot| predicate(&slot.value))
            .map(|(_, slot)| slot.value)
    }

    /// Drop every expired entry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(self.ttl));
        before.saturating_sub(self.entries.len())
    }

    /// Live values, without touching them
    pub fn values(&self) -> Vec<V> {
        self.entries
            .iter()
            .filter(|slot| !slot.is_expired(self.ttl))
            .map(|slot| slot.value.clone())
            .collect()
    }

    /// First live value matching `predicate`, touched
    pub fn find(&self, predicate: impl Fn(&V) -> bool) -> Option<V> {
        let key = self
            .entries
            .iter()
            .find(|slot| !slot.is_expired(self.ttl) && predicate(&slot.value))
            .map(|slot| slot.key().clone())?;
        self.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn make_room(&self) {
        if self.entries.len() < self.capacity {
            return;
        }
        self.purge_expired();
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|slot| slot.touched)
                .map(|slot| slot.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}
