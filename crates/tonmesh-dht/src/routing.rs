//! Kademlia Routing Table
//!
//! 256-bit ids give 257 buckets: bucket `i` holds ids whose highest
//! differing bit from ours is bit `i - 1`, bucket 0 only our own id.
//! Each bucket keeps at most `k` entries ordered least recently used
//! first, plus a replacement cache of the same capacity.

use std::collections::VecDeque;
use std::time::Duration;

use tonmesh_crypto::ShortId;
use tracing::trace;

/// Number of buckets for 256-bit ids
pub const NUM_BUCKETS: usize = 257;

/// An entry that can live in the routing table
pub trait RoutingEntry: Clone {
    fn id(&self) -> &ShortId;

    /// Average round trip; `None` if unknown or every probe failed
    fn latency(&self) -> Option<Duration> {
        None
    }

    /// Absorb a fresher copy of the same entry
    fn refresh(&mut self, newer: Self) {
        *self = newer;
    }
}

/// Ring of recent ping results
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    samples: VecDeque<Option<Duration>>,
    capacity: usize,
}

impl LatencyHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a round trip, or `None` for a failed probe
    pub fn record(&mut self, sample: Option<Duration>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of successful samples; `None` when there are none
    pub fn average(&self) -> Option<Duration> {
        let ok: Vec<Duration> = self.samples.iter().flatten().copied().collect();
        if ok.is_empty() {
            return None;
        }
        Some(ok.iter().sum::<Duration>() / ok.len() as u32)
    }

    /// The most recent sample was a failure
    pub fn last_failed(&self) -> bool {
        matches!(self.samples.back(), Some(None))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of [`RoutingTable::add`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome<T> {
    /// Already present; moved to most recently used
    Refreshed,
    /// Appended to a bucket with room
    Inserted,
    /// Bucket full; the entry went to the replacement cache and
    /// `candidate` is the resident to probe for eviction
    Full { candidate: T },
    /// Our own id is never stored
    Ignored,
}

/// Latency ordering key: unknown sorts after every measured value
fn latency_rank(latency: Option<Duration>) -> (bool, Duration) {
    match latency {
        Some(d) => (false, d),
        None => (true, Duration::ZERO),
    }
}

/// A K-bucket
#[derive(Debug)]
pub struct KBucket<T> {
    /// Least recently used first
    entries: VecDeque<T>,
    /// Oldest first
    replacements: VecDeque<T>,
    k: usize,
}

impl<T: RoutingEntry> KBucket<T> {
    pub fn new(k: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(k),
            replacements: VecDeque::with_capacity(k),
            k,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.k
    }

    pub fn replacement_len(&self) -> usize {
        self.replacements.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    fn position(&self, id: &ShortId) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }

    pub fn add(&mut self, entry: T) -> AddOutcome<T> {
        if let Some(pos) = self.position(entry.id()) {
            if let Some(mut existing) = self.entries.remove(pos) {
                existing.refresh(entry);
                self.entries.push_back(existing);
            }
            return AddOutcome::Refreshed;
        }

        if !self.is_full() {
            self.replacements.retain(|r| r.id() != entry.id());
            self.entries.push_back(entry);
            return AddOutcome::Inserted;
        }

        self.replacements.retain(|r| r.id() != entry.id());
        if self.replacements.len() >= self.k {
            self.replacements.pop_front();
        }
        self.replacements.push_back(entry);

        match self.eviction_candidate() {
            Some(candidate) => AddOutcome::Full { candidate },
            None => AddOutcome::Ignored,
        }
    }

    /// Worst average latency; among equals the least recently used
    pub fn eviction_candidate(&self) -> Option<T> {
        let mut worst: Option<&T> = None;
        for entry in &self.entries {
            match worst {
                Some(w) if latency_rank(entry.latency()) <= latency_rank(w.latency()) => {}
                _ => worst = Some(entry),
            }
        }
        worst.cloned()
    }

    pub fn get(&self, id: &ShortId) -> Option<&T> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn get_mut(&mut self, id: &ShortId) -> Option<&mut T> {
        self.entries.iter_mut().find(|e| e.id() == id)
    }

    /// Move an entry to most recently used
    pub fn touch(&mut self, id: &ShortId) -> bool {
        match self.position(id).and_then(|pos| self.entries.remove(pos)) {
            Some(entry) => {
                self.entries.push_back(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &ShortId) -> Option<T> {
        let pos = self.position(id)?;
        self.entries.remove(pos)
    }

    /// Drop a dead resident and promote the newest replacement
    pub fn replace_dead(&mut self, id: &ShortId) -> Option<T> {
        let removed = self.remove(id)?;
        if let Some(replacement) = self.replacements.pop_back() {
            self.entries.push_back(replacement);
        }
        Some(removed)
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable<T> {
    local_id: ShortId,
    buckets: Vec<KBucket<T>>,
    k: usize,
}

impl<T: RoutingEntry> RoutingTable<T> {
    pub fn new(local_id: ShortId, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| KBucket::new(k)).collect();
        Self {
            local_id,
            buckets,
            k,
        }
    }

    pub fn local_id(&self) -> &ShortId {
        &self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Bucket index for an id: 256 minus the common prefix length
    pub fn bucket_index(&self, id: &ShortId) -> usize {
        NUM_BUCKETS - 1 - self.local_id.leading_zeros(id) as usize
    }

    pub fn add(&mut self, entry: T) -> AddOutcome<T> {
        if entry.id() == &self.local_id {
            return AddOutcome::Ignored;
        }
        let index = self.bucket_index(entry.id());
        let id = *entry.id();
        let outcome = self.buckets[index].add(entry);
        trace!("Routing add {} to bucket {}: {:?}", id, index, outcome_name(&outcome));
        outcome
    }

    pub fn get(&self, id: &ShortId) -> Option<&T> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    pub fn get_mut(&mut self, id: &ShortId) -> Option<&mut T> {
        let index = self.bucket_index(id);
        self.buckets[index].get_mut(id)
    }

    pub fn contains(&self, id: &ShortId) -> bool {
        self.get(id).is_some()
    }

    pub fn touch(&mut self, id: &ShortId) -> bool {
        let index = self.bucket_index(id);
        self.buckets[index].touch(id)
    }

    pub fn remove(&mut self, id: &ShortId) -> Option<T> {
        let index = self.bucket_index(id);
        self.buckets[index].remove(id)
    }

    /// Evict a resident that failed its probe
    pub fn replace_dead(&mut self, id: &ShortId) -> Option<T> {
        let index = self.bucket_index(id);
        self.buckets[index].replace_dead(id)
    }

    /// The `count` entries closest to `target`, closest first
    pub fn nearest(&self, target: &ShortId, count: usize) -> Vec<T> {
        let mut results: Vec<(ShortId, &T)> = Vec::with_capacity(count + 1);
        if count == 0 {
            return Vec::new();
        }
        for entry in self.buckets.iter().flat_map(|b| b.entries()) {
            let distance = ShortId::from_bytes(target.distance(entry.id()));
            if results.len() == count && distance >= results[count - 1].0 {
                continue;
            }
            let pos = results.partition_point(|(d, _)| *d <= distance);
            results.insert(pos, (distance, entry));
            results.truncate(count);
        }
        results.into_iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buckets.iter().flat_map(|b| b.entries())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    pub fn bucket(&self, index: usize) -> Option<&KBucket<T>> {
        self.buckets.get(index)
    }
}

fn outcome_name<T>(outcome: &AddOutcome<T>) -> &'static str {
    match outcome {
        AddOutcome::Refreshed => "refreshed",
        AddOutcome::Inserted => "inserted",
        AddOutcome::Full { .. } => "full",
        AddOutcome::Ignored => "ignored",
    }
}
