// SPDX-License-Identifier: Apache-2.0

//! Shared request/response rings.
//!
//! A [`SharedRing`] is the page both sides see. The backend drives it through
//! a [`BackRing`] (consumes requests, produces responses) and the guest
//! through a [`FrontRing`]. Producers write the slot, then release-store the
//! producer index. Consumers acquire-load the producer index, then read the
//! slot. The notification checks put a full fence between publishing an
//! index and reading the peer's event index.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::protocol::{RxRequest, RxSlot, TxResponse, TxSlot};

/// Free-running ring index, masked on access.
pub type RingIdx = u32;

pub type TxSharedRing = SharedRing<TxSlot, TxResponse>;
pub type RxSharedRing = SharedRing<RxRequest, RxSlot>;
pub type TxBackRing = BackRing<TxSlot, TxResponse>;
pub type RxBackRing = BackRing<RxRequest, RxSlot>;
pub type TxFrontRing = FrontRing<TxSlot, TxResponse>;
pub type RxFrontRing = FrontRing<RxRequest, RxSlot>;

pub struct SharedRing<Req, Rsp> {
    req_prod: AtomicU32,
    req_event: AtomicU32,
    rsp_prod: AtomicU32,
    rsp_event: AtomicU32,
    req: Box<[UnsafeCell<Req>]>,
    rsp: Box<[UnsafeCell<Rsp>]>,
}

// SAFETY: slots are only written by the side that owns them at that index
// (the requester below `req_prod`, the responder below `rsp_prod`) and only
// read after the matching producer index has been observed with acquire
// ordering.
unsafe impl<Req: Send, Rsp: Send> Sync for SharedRing<Req, Rsp> {}

impl<Req: Copy + Default, Rsp: Copy + Default> SharedRing<Req, Rsp> {
    pub fn new(size: usize) -> Arc<Self> {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        Arc::new(SharedRing {
            req_prod: AtomicU32::new(0),
            req_event: AtomicU32::new(1),
            rsp_prod: AtomicU32::new(0),
            rsp_event: AtomicU32::new(1),
            req: (0..size).map(|_| UnsafeCell::new(Req::default())).collect(),
            rsp: (0..size).map(|_| UnsafeCell::new(Rsp::default())).collect(),
        })
    }

    pub fn size(&self) -> u32 {
        self.req.len() as u32
    }

    pub fn req_prod(&self) -> RingIdx {
        self.req_prod.load(Ordering::Acquire)
    }

    pub fn rsp_prod(&self) -> RingIdx {
        self.rsp_prod.load(Ordering::Acquire)
    }

    pub fn set_req_event(&self, idx: RingIdx) {
        self.req_event.store(idx, Ordering::Release);
    }

    pub fn set_rsp_event(&self, idx: RingIdx) {
        self.rsp_event.store(idx, Ordering::Release);
    }

    fn mask(&self, idx: RingIdx) -> usize {
        (idx & (self.size() - 1)) as usize
    }

    fn read_req(&self, idx: RingIdx) -> Req {
        // SAFETY: the caller observed `req_prod > idx`; the requester does not
        // rewrite this slot before the response for it has been consumed.
        unsafe { std::ptr::read_volatile(self.req[self.mask(idx)].get()) }
    }

    fn write_req(&self, idx: RingIdx, req: Req) {
        // SAFETY: the slot is private to the requester until `req_prod` moves
        // past it.
        unsafe { std::ptr::write_volatile(self.req[self.mask(idx)].get(), req) }
    }

    fn read_rsp(&self, idx: RingIdx) -> Rsp {
        // SAFETY: see `read_req`.
        unsafe { std::ptr::read_volatile(self.rsp[self.mask(idx)].get()) }
    }

    fn write_rsp(&self, idx: RingIdx, rsp: Rsp) {
        // SAFETY: see `write_req`.
        unsafe { std::ptr::write_volatile(self.rsp[self.mask(idx)].get(), rsp) }
    }
}

impl<Req, Rsp> fmt::Debug for SharedRing<Req, Rsp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRing")
            .field("size", &self.req.len())
            .field("req_prod", &self.req_prod.load(Ordering::Relaxed))
            .field("req_event", &self.req_event.load(Ordering::Relaxed))
            .field("rsp_prod", &self.rsp_prod.load(Ordering::Relaxed))
            .field("rsp_event", &self.rsp_event.load(Ordering::Relaxed))
            .finish()
    }
}

/// Backend view: consumes requests, produces responses.
pub struct BackRing<Req, Rsp> {
    sring: Arc<SharedRing<Req, Rsp>>,
    req_cons: RingIdx,
    rsp_prod_pvt: RingIdx,
}

impl<Req: Copy + Default, Rsp: Copy + Default> BackRing<Req, Rsp> {
    pub fn new(sring: Arc<SharedRing<Req, Rsp>>) -> Self {
        BackRing {
            sring,
            req_cons: 0,
            rsp_prod_pvt: 0,
        }
    }

    pub fn shared(&self) -> &Arc<SharedRing<Req, Rsp>> {
        &self.sring
    }

    pub fn size(&self) -> u32 {
        self.sring.size()
    }

    pub fn req_cons(&self) -> RingIdx {
        self.req_cons
    }

    pub fn set_req_cons(&mut self, idx: RingIdx) {
        self.req_cons = idx;
    }

    pub fn rsp_prod_pvt(&self) -> RingIdx {
        self.rsp_prod_pvt
    }

    /// Requests published by the guest and not yet consumed, bounded by the
    /// response space left.
    pub fn unconsumed_requests(&self) -> u32 {
        let published = self.sring.req_prod().wrapping_sub(self.req_cons);
        let room = self
            .size()
            .wrapping_sub(self.req_cons.wrapping_sub(self.rsp_prod_pvt));
        published.min(room)
    }

    /// Checks for requests and, if there are none, asks the guest for a
    /// notification on the next one before checking again.
    pub fn final_check_for_requests(&self) -> u32 {
        let pending = self.unconsumed_requests();
        if pending > 0 {
            return pending;
        }
        self.sring.set_req_event(self.req_cons.wrapping_add(1));
        fence(Ordering::SeqCst);
        self.unconsumed_requests()
    }

    /// Reads the request at `idx`. Only meaningful below the producer index
    /// returned by [`unconsumed_requests`](Self::unconsumed_requests).
    pub fn request(&self, idx: RingIdx) -> Req {
        self.sring.read_req(idx)
    }

    pub fn push_response(&mut self, rsp: Rsp) {
        self.sring.write_rsp(self.rsp_prod_pvt, rsp);
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Publishes the private responses. Returns true when the guest asked to
    /// be notified for an index inside the published range.
    pub fn push_responses_and_check_notify(&mut self) -> bool {
        let old = self.sring.rsp_prod.load(Ordering::Relaxed);
        let new = self.rsp_prod_pvt;
        self.sring.rsp_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        let event = self.sring.rsp_event.load(Ordering::Acquire);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }
}

/// Guest view: produces requests, consumes responses.
pub struct FrontRing<Req, Rsp> {
    sring: Arc<SharedRing<Req, Rsp>>,
    req_prod_pvt: RingIdx,
    rsp_cons: RingIdx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl<Req: Copy + Default, Rsp: Copy + Default> FrontRing<Req, Rsp> {
    pub fn new(sring: Arc<SharedRing<Req, Rsp>>) -> Self {
        FrontRing {
            sring,
            req_prod_pvt: 0,
            rsp_cons: 0,
        }
    }

    pub fn shared(&self) -> &Arc<SharedRing<Req, Rsp>> {
        &self.sring
    }

    pub fn free_requests(&self) -> u32 {
        self.sring
            .size()
            .wrapping_sub(self.req_prod_pvt.wrapping_sub(self.rsp_cons))
    }

    pub fn push_request(&mut self, req: Req) -> Result<(), RingFull> {
        if self.free_requests() == 0 {
            return Err(RingFull);
        }
        self.sring.write_req(self.req_prod_pvt, req);
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
        Ok(())
    }

    pub fn push_requests_and_check_notify(&mut self) -> bool {
        let old = self.sring.req_prod.load(Ordering::Relaxed);
        let new = self.req_prod_pvt;
        self.sring.req_prod.store(new, Ordering::Release);
        fence(Ordering::SeqCst);
        let event = self.sring.req_event.load(Ordering::Acquire);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }

    pub fn unconsumed_responses(&self) -> u32 {
        self.sring.rsp_prod().wrapping_sub(self.rsp_cons)
    }

    pub fn pop_response(&mut self) -> Option<Rsp> {
        if self.unconsumed_responses() == 0 {
            return None;
        }
        let rsp = self.sring.read_rsp(self.rsp_cons);
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Some(rsp)
    }

    /// Re-arms the response event and reports whether responses arrived in
    /// the meantime.
    pub fn final_check_for_responses(&self) -> bool {
        if self.unconsumed_responses() > 0 {
            return true;
        }
        self.sring.set_rsp_event(self.rsp_cons.wrapping_add(1));
        fence(Ordering::SeqCst);
        self.unconsumed_responses() > 0
    }
}
