// SPDX-License-Identifier: Apache-2.0

//! Pending transmit slots.
//!
//! A fixed ring of free slot indices (`prod`/`cons`, masked) plus per-slot
//! state. A slot is either on the free ring or owned by one in-flight guest
//! descriptor, and only goes back to the free ring once its grant has been
//! unmapped.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::grant::GrantHandle;
use crate::netif::NetifRef;
use crate::page::{Lease, Page};
use crate::protocol::{NetifStatus, TxRequest};

/// Descriptor a slot is answering for.
pub struct PendingTx {
    pub netif: NetifRef,
    pub req: TxRequest,
    /// Extra-info slots consumed behind the request, each owed a NULL response.
    pub extra_slots: u8,
    pub status: NetifStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Owned,
}

struct Slot {
    state: SlotState,
    page: Arc<Page>,
    handle: Option<GrantHandle>,
    pending: Option<PendingTx>,
    lease: Weak<Lease>,
}

pub struct PendingPool {
    ring: Box<[u16]>,
    prod: u32,
    cons: u32,
    slots: Vec<Slot>,
    /// Slots lent to packets, oldest first, with the time they were filled.
    inuse: VecDeque<(u16, Instant)>,
}

impl PendingPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two() && capacity <= u16::MAX as usize + 1);
        PendingPool {
            ring: (0..capacity as u32).map(|i| i as u16).collect(),
            prod: capacity as u32,
            cons: 0,
            slots: (0..capacity)
                .map(|_| Slot {
                    state: SlotState::Free,
                    page: Page::new(),
                    handle: None,
                    pending: None,
                    lease: Weak::new(),
                })
                .collect(),
            inuse: VecDeque::new(),
        }
    }

    fn mask(&self, idx: u32) -> usize {
        idx as usize & (self.ring.len() - 1)
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn free_count(&self) -> usize {
        self.prod.wrapping_sub(self.cons) as usize
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.free_count()
    }

    pub fn acquire(&mut self) -> Option<u16> {
        if self.free_count() == 0 {
            return None;
        }
        let idx = self.ring[self.mask(self.cons)];
        self.cons = self.cons.wrapping_add(1);
        let slot = &mut self.slots[idx as usize];
        assert_eq!(slot.state, SlotState::Free, "pending slot {idx} handed out twice");
        slot.state = SlotState::Owned;
        Some(idx)
    }

    pub fn release(&mut self, idx: u16) {
        let slot = &mut self.slots[idx as usize];
        assert_eq!(slot.state, SlotState::Owned, "pending slot {idx} released twice");
        assert!(slot.handle.is_none(), "pending slot {idx} released while mapped");
        slot.state = SlotState::Free;
        slot.pending = None;
        slot.lease = Weak::new();
        let pos = self.mask(self.prod);
        self.ring[pos] = idx;
        self.prod = self.prod.wrapping_add(1);
    }

    pub fn is_owned(&self, idx: u16) -> bool {
        self.slots[idx as usize].state == SlotState::Owned
    }

    pub fn page(&self, idx: u16) -> &Arc<Page> {
        &self.slots[idx as usize].page
    }

    /// Gives the slot a fresh page; the old one now belongs to whoever
    /// holds it.
    pub fn replace_page(&mut self, idx: u16) {
        self.slots[idx as usize].page = Page::new();
    }

    pub fn set_pending(&mut self, idx: u16, pending: PendingTx) {
        self.slots[idx as usize].pending = Some(pending);
    }

    pub fn pending(&self, idx: u16) -> Option<&PendingTx> {
        self.slots[idx as usize].pending.as_ref()
    }

    pub fn pending_mut(&mut self, idx: u16) -> Option<&mut PendingTx> {
        self.slots[idx as usize].pending.as_mut()
    }

    pub fn take_pending(&mut self, idx: u16) -> Option<PendingTx> {
        self.slots[idx as usize].pending.take()
    }

    pub fn set_handle(&mut self, idx: u16, handle: GrantHandle) {
        self.slots[idx as usize].handle = Some(handle);
    }

    pub fn handle(&self, idx: u16) -> Option<GrantHandle> {
        self.slots[idx as usize].handle
    }

    pub fn take_handle(&mut self, idx: u16) -> Option<GrantHandle> {
        self.slots[idx as usize].handle.take()
    }

    pub(crate) fn lend(&mut self, idx: u16, lease: Weak<Lease>, now: Instant) {
        self.slots[idx as usize].lease = lease;
        self.inuse.push_back((idx, now));
    }

    pub(crate) fn lease(&self, idx: u16) -> Option<Arc<Lease>> {
        self.slots[idx as usize].lease.upgrade()
    }

    pub fn untrack(&mut self, idx: u16) {
        if let Some(pos) = self.inuse.iter().position(|(i, _)| *i == idx) {
            self.inuse.remove(pos);
        }
    }

    pub fn oldest_inuse(&self) -> Option<Instant> {
        self.inuse.front().map(|(_, since)| *since)
    }

    /// Lent slots filled at or before `deadline`, oldest first.
    pub fn inuse_since(&self, deadline: Instant) -> Vec<u16> {
        self.inuse
            .iter()
            .take_while(|(_, since)| *since <= deadline)
            .map(|(idx, _)| *idx)
            .collect()
    }

    pub fn check_accounting(&self) -> bool {
        let owned = self
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Owned)
            .count();
        owned + self.free_count() == self.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dealloc::DeallocRing;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_acquire_until_exhausted() {
        let mut pool = PendingPool::new(4);
        let got: Vec<u16> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.in_flight(), 4);
        pool.release(2);
        assert_eq!(pool.acquire(), Some(2));
        assert!(pool.check_accounting());
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let mut pool = PendingPool::new(4);
        let idx = pool.acquire().unwrap();
        pool.release(idx);
        pool.release(idx);
    }

    #[test]
    #[should_panic(expected = "released while mapped")]
    fn test_release_while_mapped_panics() {
        let mut pool = PendingPool::new(4);
        let idx = pool.acquire().unwrap();
        pool.set_handle(idx, 11);
        pool.release(idx);
    }

    #[test]
    fn test_accounting_under_concurrent_release() {
        // Releases arrive on the dealloc ring from several threads while one
        // consumer keeps acquiring and draining.
        let pool = Arc::new(Mutex::new(PendingPool::new(64)));
        let ring = Arc::new(DeallocRing::new(64));
        let (tx, rx) = std::sync::mpsc::channel::<u16>();
        let rx = Arc::new(Mutex::new(rx));
        let done = Arc::new(AtomicBool::new(false));

        let releasers: Vec<_> = (0..4)
            .map(|_| {
                let ring = ring.clone();
                let rx = rx.clone();
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let next = rx.lock().unwrap().try_recv();
                        match next {
                            Ok(idx) => ring.push(idx),
                            Err(_) => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();

        let mut handed_out = 0;
        while handed_out < 5000 {
            let mut p = pool.lock().unwrap();
            while let Some(idx) = p.acquire() {
                tx.send(idx).unwrap();
                handed_out += 1;
            }
            let mut drained = Vec::new();
            ring.drain_into(&mut drained);
            let unique: HashSet<u16> = drained.iter().copied().collect();
            assert_eq!(unique.len(), drained.len());
            for idx in drained {
                p.release(idx);
            }
            assert!(p.check_accounting());
        }

        done.store(true, Ordering::SeqCst);
        for h in releasers {
            h.join().unwrap();
        }
        let mut p = pool.lock().unwrap();
        let mut drained = Vec::new();
        ring.drain_into(&mut drained);
        for idx in drained {
            p.release(idx);
        }
        assert!(p.check_accounting());
    }

    #[test]
    fn test_inuse_tracking() {
        let mut pool = PendingPool::new(4);
        let t0 = Instant::now();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.lend(a, Weak::new(), t0);
        pool.lend(b, Weak::new(), t0 + std::time::Duration::from_millis(10));
        assert_eq!(pool.inuse_since(t0), vec![a]);
        pool.untrack(a);
        assert_eq!(pool.oldest_inuse(), Some(t0 + std::time::Duration::from_millis(10)));
    }
}
