//! Fragmentation and reassembly of large messages
//!
//! A message whose encoding exceeds the per-packet budget is split into
//! `Part` messages that share the SHA-256 of the whole encoding. The
//! receiver collects parts into a buffer, tracks which byte ranges are
//! covered, and hands the buffer on exactly once after the hash matches.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tonmesh_crypto::ShortId;

use crate::cache::TtlCache;
use crate::error::{AdnlError, AdnlResult};
use crate::message::Message;

/// Budget taken by a `Part` message besides its data
const PART_OVERHEAD: usize = 48;

/// Largest handshake message riding along with a part (`ConfirmChannel`)
const MAX_HANDSHAKE: usize = 72;

/// Payload bytes per part: leaves room for either handshake message
pub const PART_SIZE: usize = crate::MAX_ADNL_MESSAGE - PART_OVERHEAD - MAX_HANDSHAKE;

/// Split an encoded message into parts
pub fn split(encoded: &Bytes, part_size: usize) -> Vec<Message> {
    let hash = *ShortId::hash(encoded).as_bytes();
    let total_size = encoded.len() as u32;
    let part_size = part_size.max(1);

    (0..encoded.len())
        .step_by(part_size)
        .map(|offset| {
            let end = (offset + part_size).min(encoded.len());
            Message::Part {
                hash,
                total_size,
                offset: offset as u32,
                data: encoded.slice(offset..end),
            }
        })
        .collect()
}

/// Disjoint, merged half-open byte ranges
#[derive(Debug, Default)]
struct Coverage {
    ranges: BTreeMap<usize, usize>,
    covered: usize,
}

impl Coverage {
    fn contains(&self, start: usize, end: usize) -> bool {
        self.ranges
            .range(..=start)
            .next_back()
            .map_or(false, |(_, &e)| e >= end)
    }

    fn insert(&mut self, start: usize, end: usize) {
        let mut start = start;
        let mut end = end;

        // Merge with a range that starts before and reaches us
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
                self.covered -= e - s;
            }
        }
        // Swallow ranges that start inside the new one
        let inside: Vec<(usize, usize)> = self
            .ranges
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in inside {
            end = end.max(e);
            self.ranges.remove(&s);
            self.covered -= e - s;
        }

        self.ranges.insert(start, end);
        self.covered += end - start;
    }
}

/// One in-progress reassembly
pub struct PartTransfer {
    hash: [u8; 32],
    total_size: usize,
    state: Mutex<TransferState>,
    delivered: AtomicBool,
}

struct TransferState {
    buffer: Vec<u8>,
    coverage: Coverage,
}

impl PartTransfer {
    pub fn new(hash: [u8; 32], total_size: usize) -> Self {
        Self {
            hash,
            total_size,
            state: Mutex::new(TransferState {
                buffer: vec![0u8; total_size],
                coverage: Coverage::default(),
            }),
            delivered: AtomicBool::new(false),
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Record a fragment; false if its range was already covered
    pub fn add(&self, offset: usize, data: &[u8]) -> AdnlResult<bool> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.total_size)
            .ok_or_else(|| {
                AdnlError::InvalidPart(format!(
                    "range {}+{} outside {} bytes",
                    offset,
                    data.len(),
                    self.total_size
                ))
            })?;
        if data.is_empty() {
            return Err(AdnlError::InvalidPart("empty part".into()));
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.coverage.contains(offset, end) {
            return Ok(false);
        }
        state.buffer[offset..end].copy_from_slice(data);
        state.coverage.insert(offset, end);
        Ok(true)
    }

    pub fn received(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .coverage
            .covered
    }

    pub fn is_complete(&self) -> bool {
        self.received() >= self.total_size
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// The assembled bytes, returned to exactly one caller once the
    /// transfer is complete and its hash checks out
    pub fn take(&self) -> AdnlResult<Option<Bytes>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.coverage.covered < self.total_size {
            return Ok(None);
        }
        if ShortId::hash(&state.buffer).as_bytes() != &self.hash {
            return Err(AdnlError::InvalidPart("hash mismatch".into()));
        }
        if self
            .delivered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&state.buffer)))
    }
}

/// Per-connection set of transfers
pub struct Reassembler {
    transfers: TtlCache<[u8; 32], Arc<PartTransfer>>,
    max_size: usize,
}

impl Reassembler {
    pub fn new(max_transfers: usize, ttl: Duration, max_size: usize) -> Self {
        Self {
            transfers: TtlCache::new(max_transfers, ttl),
            max_size,
        }
    }

    /// Feed a part; yields the encoded inner message once, when complete
    pub fn accept(
        &self,
        hash: [u8; 32],
        total_size: u32,
        offset: u32,
        data: &[u8],
    ) -> AdnlResult<Option<Bytes>> {
        let total_size = total_size as usize;
        if total_size == 0 || total_size > self.max_size {
            return Err(AdnlError::MessageTooLarge {
                size: total_size,
                max: self.max_size,
            });
        }

        let transfer = self
            .transfers
            .get_or_insert_with(hash, || Arc::new(PartTransfer::new(hash, total_size)));
        if transfer.total_size() != total_size {
            return Err(AdnlError::InvalidPart(format!(
                "total size {} differs from {}",
                total_size,
                transfer.total_size()
            )));
        }
        if transfer.is_delivered() || !transfer.add(offset as usize, data)? {
            return Ok(None);
        }
        let taken = transfer.take();
        if taken.is_err() {
            // Corrupt assembly; a resend starts from scratch
            self.transfers.remove(&hash);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn reassembler() -> Reassembler {
        Reassembler::new(10, Duration::from_secs(5), 1 << 20)
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 % 251) as u8).collect::<Vec<_>>())
    }

    fn feed(r: &Reassembler, part: &Message) -> AdnlResult<Option<Bytes>> {
        match part {
            Message::Part {
                hash,
                total_size,
                offset,
                data,
            } => r.accept(*hash, *total_size, *offset, data),
            other => panic!("not a part: {:?}", other),
        }
    }

    #[test]
    fn test_split_sizes() {
        let data = payload(2500);
        let parts = split(&data, 1000);
        assert_eq!(parts.len(), 3);
        let sizes: Vec<usize> = parts
            .iter()
            .map(|p| match p {
                Message::Part { data, .. } => data.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[test]
    fn test_any_order_with_duplicates_delivers_once() {
        let data = payload(5000);
        let mut parts = split(&data, 700);
        // Every part twice, shuffled
        parts.extend(parts.clone());
        parts.shuffle(&mut rand::thread_rng());

        let r = reassembler();
        let mut delivered = Vec::new();
        for part in &parts {
            if let Some(bytes) = feed(&r, part).unwrap() {
                delivered.push(bytes);
            }
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], data);
    }

    #[test]
    fn test_overlapping_parts_do_not_fake_completion() {
        let data = payload(300);
        let hash = *ShortId::hash(&data).as_bytes();
        let r = reassembler();

        // 0..200 and 100..300 cover everything only together
        assert!(r.accept(hash, 300, 0, &data[..200]).unwrap().is_none());
        assert!(r.accept(hash, 300, 50, &data[50..150]).unwrap().is_none());
        let out = r.accept(hash, 300, 100, &data[100..]).unwrap();
        assert_eq!(out.unwrap(), data);
    }

    #[test]
    fn test_sum_of_lengths_is_not_enough() {
        let transfer = PartTransfer::new([0; 32], 100);
        assert!(transfer.add(0, &[1; 60]).unwrap());
        assert!(transfer.add(20, &[1; 60]).unwrap());
        // 120 bytes received in total, but 80..100 is missing
        assert_eq!(transfer.received(), 80);
        assert!(!transfer.is_complete());
    }

    #[test]
    fn test_duplicate_range_rejected() {
        let transfer = PartTransfer::new([0; 32], 10);
        assert!(transfer.add(0, &[1; 5]).unwrap());
        assert!(!transfer.add(0, &[2; 5]).unwrap());
        assert!(!transfer.add(1, &[2; 3]).unwrap());
    }

    #[test]
    fn test_hash_mismatch() {
        let data = payload(100);
        let r = reassembler();
        let result = r.accept([9; 32], 100, 0, &data);
        assert!(matches!(result, Err(AdnlError::InvalidPart(_))));
    }

    #[test]
    fn test_resend_after_hash_mismatch() {
        let data = payload(300);
        let hash = *ShortId::hash(&data).as_bytes();
        let r = reassembler();

        let mut corrupt = data.to_vec();
        corrupt[10] ^= 0xff;
        assert!(r.accept(hash, 300, 0, &corrupt[..150]).unwrap().is_none());
        assert!(matches!(
            r.accept(hash, 300, 150, &corrupt[150..]),
            Err(AdnlError::InvalidPart(_))
        ));
        assert!(r.is_empty());

        assert!(r.accept(hash, 300, 0, &data[..150]).unwrap().is_none());
        assert_eq!(r.accept(hash, 300, 150, &data[150..]).unwrap().unwrap(), data);
    }

    #[test]
    fn test_part_fits_with_any_handshake() {
        let data = payload(5000);
        let handshake = Message::ConfirmChannel {
            key: tonmesh_crypto::PrivateKey::generate().public_key(),
            peer_key: tonmesh_crypto::PrivateKey::generate().public_key(),
            date: 1,
        };
        for part in split(&data, PART_SIZE) {
            assert!(part.serialized_size() + handshake.serialized_size() <= crate::MAX_ADNL_MESSAGE);
        }
    }

    #[test]
    fn test_out_of_bounds_part() {
        let r = reassembler();
        assert!(r.accept([1; 32], 100, 90, &[0; 20]).is_err());
        assert!(r.accept([2; 32], 100, 0, &[]).is_err());
    }

    #[test]
    fn test_size_limits() {
        let r = Reassembler::new(10, Duration::from_secs(5), 1000);
        assert!(matches!(
            r.accept([1; 32], 1001, 0, &[0; 10]),
            Err(AdnlError::MessageTooLarge { .. })
        ));
        assert!(r.accept([1; 32], 0, 0, &[0; 10]).is_err());
    }

    #[test]
    fn test_inconsistent_total_size() {
        let r = reassembler();
        assert!(r.accept([3; 32], 100, 0, &[0; 10]).unwrap().is_none());
        assert!(r.accept([3; 32], 200, 10, &[0; 10]).is_err());
    }

    #[test]
    fn test_transfer_count_is_bounded() {
        let r = Reassembler::new(3, Duration::from_secs(5), 1 << 20);
        for i in 0..10u8 {
            r.accept([i; 32], 100, 0, &[0; 10]).unwrap();
        }
        assert!(r.len() <= 3);
    }
}
