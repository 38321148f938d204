//! Per-direction packet counters

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Sequence number and reinit date for one direction of a connection.
///
/// On the send side `seqno` is the last seqno handed out; on the receive
/// side it is the highest seqno seen so far.
#[derive(Debug, Default)]
pub struct PacketCounter {
    seqno: AtomicU64,
    reinit_date: AtomicU32,
}

impl PacketCounter {
    pub fn new(reinit_date: u32) -> Self {
        Self {
            seqno: AtomicU64::new(0),
            reinit_date: AtomicU32::new(reinit_date),
        }
    }

    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    /// Allocate the next seqno
    pub fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raise the seqno to `seqno` if it is higher; returns whether it moved
    pub fn raise_seqno(&self, seqno: u64) -> bool {
        let mut current = self.seqno.load(Ordering::Acquire);
        while seqno > current {
            match self.seqno.compare_exchange_weak(
                current,
                seqno,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    pub fn reset_seqno(&self) {
        self.seqno.store(0, Ordering::Release);
    }

    pub fn reinit_date(&self) -> u32 {
        self.reinit_date.load(Ordering::Acquire)
    }

    pub fn set_reinit_date(&self, date: u32) {
        self.reinit_date.store(date, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_high_water_mark() {
        let counter = PacketCounter::new(0);
        for seqno in [5, 3, 8] {
            counter.raise_seqno(seqno);
        }
        assert_eq!(counter.seqno(), 8);
        assert!(!counter.raise_seqno(8));
    }

    #[test]
    fn test_next_seqno() {
        let counter = PacketCounter::new(100);
        assert_eq!(counter.next_seqno(), 1);
        assert_eq!(counter.next_seqno(), 2);
        assert_eq!(counter.seqno(), 2);

        counter.reset_seqno();
        assert_eq!(counter.next_seqno(), 1);
        assert_eq!(counter.reinit_date(), 100);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let counter = Arc::new(PacketCounter::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..1000).map(|_| counter.next_seqno()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(counter.seqno(), 4000);
    }
}
