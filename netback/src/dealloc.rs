// SPDX-License-Identifier: Apache-2.0

//! Staging ring for pending slots whose pages were released.
//!
//! Any thread may push (the release hook runs wherever the last packet
//! reference drops). Producers reserve a position, store the slot index and
//! then commit in reservation order with a release store of `prod`. The
//! single consumer is the partition worker.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

pub struct DeallocRing {
    slots: Box<[AtomicU16]>,
    reserve: AtomicU32,
    prod: AtomicU32,
    cons: AtomicU32,
}

impl DeallocRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        DeallocRing {
            slots: (0..capacity).map(|_| AtomicU16::new(0)).collect(),
            reserve: AtomicU32::new(0),
            prod: AtomicU32::new(0),
            cons: AtomicU32::new(0),
        }
    }

    fn mask(&self, idx: u32) -> usize {
        idx as usize & (self.slots.len() - 1)
    }

    pub fn push(&self, slot: u16) {
        let pos = self.reserve.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            pos.wrapping_sub(self.cons.load(Ordering::Acquire)) < self.slots.len() as u32,
            "dealloc ring overrun"
        );
        self.slots[self.mask(pos)].store(slot, Ordering::Relaxed);
        while self
            .prod
            .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.cons.load(Ordering::Relaxed) != self.prod.load(Ordering::Acquire)
    }

    /// Moves every committed index into `out`. Consumer side only.
    pub fn drain_into(&self, out: &mut Vec<u16>) -> usize {
        let cons = self.cons.load(Ordering::Relaxed);
        let prod = self.prod.load(Ordering::Acquire);
        let mut idx = cons;
        while idx != prod {
            out.push(self.slots[self.mask(idx)].load(Ordering::Relaxed));
            idx = idx.wrapping_add(1);
        }
        self.cons.store(prod, Ordering::Release);
        prod.wrapping_sub(cons) as usize
    }
}

/// Deterministic shuffle of a drained batch, used to exercise out-of-order
/// responses in guests.
#[derive(Debug)]
pub struct Permuter {
    state: u32,
}

impl Default for Permuter {
    fn default() -> Self {
        Permuter { state: 0x1234_5678 }
    }
}

impl Permuter {
    pub fn permute(&mut self, batch: &mut [u16]) {
        let len = batch.len();
        for i in 0..len {
            self.state = self.state.wrapping_mul(68389);
            let offset = (self.state / 256) as usize % (len - i);
            batch.swap(i, i + offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drain_in_order() {
        let ring = DeallocRing::new(8);
        assert!(!ring.has_pending());
        ring.push(3);
        ring.push(5);
        assert!(ring.has_pending());
        let mut out = Vec::new();
        assert_eq!(ring.drain_into(&mut out), 2);
        assert_eq!(out, vec![3, 5]);
        assert!(!ring.has_pending());
    }

    #[test]
    fn test_concurrent_producers() {
        let ring = Arc::new(DeallocRing::new(256));
        let handles: Vec<_> = (0..4u16)
            .map(|t| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for i in 0..32u16 {
                        ring.push(t * 32 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut out = Vec::new();
        ring.drain_into(&mut out);
        let seen: HashSet<u16> = out.iter().copied().collect();
        assert_eq!(out.len(), 128);
        assert_eq!(seen.len(), 128);
    }

    #[test]
    fn test_permute_keeps_members() {
        let mut batch: Vec<u16> = (0..16).collect();
        Permuter::default().permute(&mut batch);
        let mut sorted = batch.clone();
        sorted.sort();
        assert_eq!(sorted, (0..16).collect::<Vec<u16>>());
        assert_ne!(batch, sorted);
    }
}
