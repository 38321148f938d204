//! DHT Value Storage

use std::collections::{HashMap, HashSet};

use tonmesh_crypto::ShortId;
use tracing::debug;

use crate::error::{DhtError, DhtResult};
use crate::value::DhtValue;

/// Local key-value store, indexed by key hash
pub struct DhtStorage {
    values: HashMap<ShortId, DhtValue>,
    /// Keys written by this node, stored again on republish
    owned: HashSet<ShortId>,
    max_values: usize,
    max_value_size: usize,
}

impl DhtStorage {
    pub fn new(max_values: usize, max_value_size: usize) -> Self {
        Self {
            values: HashMap::new(),
            owned: HashSet::new(),
            max_values,
            max_value_size,
        }
    }

    /// Live value under `key_hash`
    pub fn get(&self, key_hash: &ShortId, now: u32) -> Option<&DhtValue> {
        self.values.get(key_hash).filter(|v| !v.is_expired(now))
    }

    /// Validate `value` and merge it into the store under its update rule.
    ///
    /// Returns whether the stored value changed.
    pub fn store(&mut self, value: DhtValue, now: u32) -> DhtResult<bool> {
        value.check(now, self.max_value_size)?;

        let key_hash = value.key_hash();
        let stored = self.get(&key_hash, now);
        if stored.is_none() && self.values.len() >= self.max_values {
            self.cleanup(now);
            if self.values.len() >= self.max_values {
                return Err(DhtError::StorageFull);
            }
        }

        let rule = value.description.update_rule;
        match rule.merge(self.get(&key_hash, now), value, self.max_value_size)? {
            Some(merged) => {
                self.values.insert(key_hash, merged);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Store a value this node wrote and remember it for republishing
    pub fn store_owned(&mut self, value: DhtValue, now: u32) -> DhtResult<bool> {
        let key_hash = value.key_hash();
        let changed = self.store(value, now)?;
        self.owned.insert(key_hash);
        Ok(changed)
    }

    /// Owned values that are still alive and whose rule asks to be republished
    pub fn republishable(&self, now: u32) -> Vec<DhtValue> {
        self.owned
            .iter()
            .filter_map(|hash| self.get(hash, now))
            .filter(|v| v.description.update_rule.needs_republish())
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, key_hash: &ShortId) -> Option<DhtValue> {
        self.owned.remove(key_hash);
        self.values.remove(key_hash)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop expired values
    pub fn cleanup(&mut self, now: u32) -> usize {
        let before = self.values.len();
        self.values.retain(|_, v| !v.is_expired(now));
        let values = &self.values;
        self.owned.retain(|hash| values.contains_key(hash));
        let removed = before - self.values.len();
        if removed > 0 {
            debug!("Cleaned up {} expired DHT values", removed);
        }
        removed
    }
}
