// SPDX-License-Identifier: Apache-2.0

//! Guest transmit path: descriptors on the guest's transmit ring become
//! packets built on mapped foreign pages.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, warn};

use crate::batch::{self, OpBuffer};
use crate::credit::CreditCheck;
use crate::dealloc::Permuter;
use crate::grant::{MapOp, PageCopy, UnmapOp};
use crate::netif::{Interface, InterfaceStats, NetifRef};
use crate::packet::{Checksum, Fragment, Packet};
use crate::page::{ForeignPage, FragPage, GrantOrigin, Page};
use crate::partition::{CopyMode, Partition};
use crate::pool::{PendingPool, PendingTx};
use crate::protocol::{
    ETH_HLEN, ExtraInfo, GsoInfo, MAX_PENDING_REQS, MAX_SKB_FRAGS, NETTXF_CSUM_BLANK,
    NETTXF_DATA_VALIDATED, NETTXF_EXTRA_INFO, NETTXF_MORE_DATA, NetifStatus, PAGE_SIZE,
    PKT_PROT_LEN, TxRequest, TxResponse, XEN_NETIF_EXTRA_TYPE_GSO, XEN_NETIF_EXTRA_TYPE_MAX,
    XEN_NETIF_EXTRA_TYPE_NONE, XEN_NETIF_GSO_TYPE_TCPV4,
};
use crate::ring::{RingIdx, TxBackRing};
use crate::time::Timer;
use crate::{Result, lock};

/// Age after which a lent page is copied out.
const COPY_DELAY: Duration = Duration::from_millis(500);
/// Pending-copy check fires this long after the oldest lent page was filled.
const TX_PENDING_DELAY: Duration = Duration::from_secs(1);

/// A packet whose slots are mapped (or about to be) in this pass.
struct Nascent {
    netif: NetifRef,
    head: u16,
    header_len: usize,
    /// Slots becoming fragments, in order. Starts with `head` when the first
    /// page holds more than the header.
    frags: Vec<u16>,
    gso: Option<GsoInfo>,
}

impl Nascent {
    fn head_in_frags(&self) -> bool {
        self.frags.first() == Some(&self.head)
    }
}

pub(crate) struct TxState {
    map_ops: OpBuffer<MapOp>,
    unmap_ops: OpBuffer<UnmapOp>,
    nascent: VecDeque<Nascent>,
    drained: Vec<u16>,
    released: Vec<u16>,
    permuter: Permuter,
}

impl Default for TxState {
    fn default() -> Self {
        TxState {
            map_ops: OpBuffer::with_capacity("grant map", MAX_PENDING_REQS),
            unmap_ops: OpBuffer::with_capacity("grant unmap", MAX_PENDING_REQS),
            nascent: VecDeque::new(),
            drained: Vec::with_capacity(MAX_PENDING_REQS),
            released: Vec::with_capacity(MAX_PENDING_REQS),
            permuter: Permuter::default(),
        }
    }
}

/// A request that could not be turned into a packet.
struct Malformed {
    /// Ring index one past the last slot that belongs to the request.
    end: RingIdx,
    reason: &'static str,
}

/// Queues a response for `id` plus one NULL response per extra slot.
fn queue_response(ring: &mut TxBackRing, id: u16, status: NetifStatus, extra_slots: u8) {
    ring.push_response(TxResponse {
        id,
        status: status.code(),
    });
    for _ in 0..extra_slots {
        ring.push_response(TxResponse {
            id: 0,
            status: NetifStatus::Null.code(),
        });
    }
}

/// Reads the extra-info records following a request. Returns the GSO record
/// if any and the number of slots consumed.
fn get_extras(
    ring: &TxBackRing,
    work_to_do: u32,
) -> std::result::Result<(Option<ExtraInfo>, u8), (u8, &'static str)> {
    let mut gso = None;
    let mut consumed: u8 = 0;
    let mut cons = ring.req_cons();
    loop {
        if u32::from(consumed) >= work_to_do {
            return Err((consumed, "missing extra info"));
        }
        let extra = ring.request(cons).extra();
        cons = cons.wrapping_add(1);
        consumed += 1;
        if extra.kind == XEN_NETIF_EXTRA_TYPE_NONE || extra.kind >= XEN_NETIF_EXTRA_TYPE_MAX {
            return Err((consumed, "invalid extra type"));
        }
        if extra.kind == XEN_NETIF_EXTRA_TYPE_GSO {
            gso = Some(extra);
        }
        if !extra.has_more() {
            return Ok((gso, consumed));
        }
    }
}

/// Number of slots from `cons` up to and including the first one without
/// `more_data`, bounded by `work_to_do`.
fn chain_len(ring: &TxBackRing, cons: RingIdx, work_to_do: u32) -> u32 {
    let mut n = 0;
    while n < work_to_do {
        let more = ring.request(cons.wrapping_add(n)).request().has_flag(NETTXF_MORE_DATA);
        n += 1;
        if !more {
            break;
        }
    }
    n
}

/// Collects the fragment descriptors chained behind `first`, shrinking
/// `first.size` to the bytes carried by its own page. On error, returns how
/// many slots the bad chain occupies so all of it gets answered.
fn count_requests(
    ring: &TxBackRing,
    first: &mut TxRequest,
    work_to_do: u32,
) -> std::result::Result<Vec<TxRequest>, (u32, &'static str)> {
    let mut frags = Vec::new();
    if !first.has_flag(NETTXF_MORE_DATA) {
        return Ok(frags);
    }
    let cons = ring.req_cons();
    let bad = |reason: &'static str| Err((chain_len(ring, cons, work_to_do), reason));
    loop {
        let n = frags.len() as u32;
        if n >= work_to_do {
            return bad("need more fragments");
        }
        if frags.len() >= MAX_SKB_FRAGS {
            return bad("too many fragments");
        }
        let txp = ring.request(cons.wrapping_add(n)).request();
        if txp.size > first.size {
            return bad("fragment larger than packet");
        }
        first.size -= txp.size;
        frags.push(txp);
        if txp.offset as usize + txp.size as usize > PAGE_SIZE {
            return bad("fragment crosses page boundary");
        }
        if !txp.has_flag(NETTXF_MORE_DATA) {
            return Ok(frags);
        }
    }
}

fn check_gso(extra: &ExtraInfo) -> std::result::Result<GsoInfo, &'static str> {
    if extra.gso.size == 0 {
        return Err("GSO size must not be zero");
    }
    if extra.gso.kind != XEN_NETIF_GSO_TYPE_TCPV4 {
        return Err("bad GSO type");
    }
    Ok(extra.gso)
}

impl Partition {
    pub(crate) fn net_tx_action(&self) -> Result<()> {
        let mut st = lock(&self.tx_state);
        let st = &mut *st;
        self.tx_action_dealloc(st)?;

        st.map_ops.clear();
        loop {
            if lock(&self.pool).in_flight() + MAX_SKB_FRAGS >= MAX_PENDING_REQS
                || st.map_ops.len() >= st.map_ops.capacity()
            {
                break;
            }
            let Some(netif) = self.schedule.pop_front() else {
                break;
            };
            self.tx_build(st, netif);
        }

        if !st.map_ops.is_empty() {
            batch::execute_map(&*self.shared.hv, &mut st.map_ops)?;
            self.tx_submit(st);
        }

        if self.shared.copy_mode == CopyMode::Delayed {
            if let Some(oldest) = lock(&self.pool).oldest_inuse() {
                self.arm_timer(oldest + TX_PENDING_DELAY, Timer::TxPending);
            }
        }
        Ok(())
    }

    /// Consumes one request from `netif` and queues its map operations.
    fn tx_build(&self, st: &mut TxState, netif: NetifRef) {
        let mut ring = lock(&netif.tx);
        let mut work_to_do = ring.final_check_for_requests();
        if work_to_do == 0 {
            return;
        }

        let mut cons = ring.req_cons();
        let mut txreq = ring.request(cons).request();

        let credit = lock(&netif.credit).check(u64::from(txreq.size), self.now());
        match credit {
            CreditCheck::Accepted => {}
            CreditCheck::TimerPending => return,
            CreditCheck::Deferred { until } => {
                drop(ring);
                debug!("{}: out of credit until {:?}", netif.id(), until);
                self.arm_timer(until, Timer::Credit(netif));
                return;
            }
        }

        work_to_do -= 1;
        cons = cons.wrapping_add(1);
        ring.set_req_cons(cons);

        let mut extra_slots = 0;
        let mut gso_extra = None;
        if txreq.has_flag(NETTXF_EXTRA_INFO) {
            match get_extras(&ring, work_to_do) {
                Ok((extra, consumed)) => {
                    extra_slots = consumed;
                    gso_extra = extra;
                    work_to_do -= u32::from(consumed);
                    cons = cons.wrapping_add(u32::from(consumed));
                    ring.set_req_cons(cons);
                }
                Err((consumed, reason)) => {
                    let end = cons.wrapping_add(u32::from(consumed));
                    // The bad extra slots are answered as extras, not requests.
                    ring.set_req_cons(end);
                    let bad = Malformed { end, reason };
                    return self.tx_err(&netif, ring, &txreq, consumed, bad);
                }
            }
        }

        let frags = match count_requests(&ring, &mut txreq, work_to_do) {
            Ok(frags) => frags,
            Err((n, reason)) => {
                let bad = Malformed {
                    end: cons.wrapping_add(n),
                    reason,
                };
                return self.tx_err(&netif, ring, &txreq, extra_slots, bad);
            }
        };
        let end = cons.wrapping_add(frags.len() as u32);

        let gso = match gso_extra.as_ref().map(check_gso).transpose() {
            Ok(gso) => gso,
            Err(reason) => {
                let bad = Malformed { end, reason };
                return self.tx_err(&netif, ring, &txreq, extra_slots, bad);
            }
        };
        if (txreq.size as usize) < ETH_HLEN {
            let bad = Malformed {
                end,
                reason: "packet too short",
            };
            return self.tx_err(&netif, ring, &txreq, extra_slots, bad);
        }
        if txreq.offset as usize + txreq.size as usize > PAGE_SIZE {
            let bad = Malformed {
                end,
                reason: "request crosses page boundary",
            };
            return self.tx_err(&netif, ring, &txreq, extra_slots, bad);
        }
        ring.set_req_cons(end);
        drop(ring);

        let data_len = if txreq.size as usize > PKT_PROT_LEN && frags.len() < MAX_SKB_FRAGS {
            PKT_PROT_LEN
        } else {
            txreq.size as usize
        };

        let mut pool = lock(&self.pool);
        let Some(head) = pool.acquire() else {
            panic!("pending pool exhausted despite headroom check");
        };
        st.map_ops
            .push(MapOp::readonly(netif.domid(), txreq.gref, pool.page(head).clone()));
        pool.set_pending(
            head,
            PendingTx {
                netif: netif.clone(),
                req: txreq,
                extra_slots,
                status: NetifStatus::Okay,
            },
        );

        let mut slots = Vec::with_capacity(frags.len() + 1);
        if data_len < txreq.size as usize {
            slots.push(head);
        }
        for txp in frags {
            let Some(idx) = pool.acquire() else {
                panic!("pending pool exhausted despite headroom check");
            };
            st.map_ops
                .push(MapOp::readonly(netif.domid(), txp.gref, pool.page(idx).clone()));
            pool.set_pending(
                idx,
                PendingTx {
                    netif: netif.clone(),
                    req: txp,
                    extra_slots: 0,
                    status: NetifStatus::Okay,
                },
            );
            slots.push(idx);
        }
        drop(pool);

        st.nascent.push_back(Nascent {
            netif: netif.clone(),
            head,
            header_len: data_len,
            frags: slots,
            gso,
        });
        self.schedule_work(netif.arc());
    }

    /// Answers a malformed request: ERROR for the request itself, NULL for
    /// its extra slots, ERROR for every chained slot up to `bad.end`.
    fn tx_err(
        &self,
        netif: &NetifRef,
        mut ring: std::sync::MutexGuard<'_, TxBackRing>,
        txreq: &TxRequest,
        extra_slots: u8,
        bad: Malformed,
    ) {
        debug!("{}: dropping request {}: {}", netif.id(), txreq.id, bad.reason);
        InterfaceStats::add(&netif.stats().tx_errors, 1);
        queue_response(&mut ring, txreq.id, NetifStatus::Error, extra_slots);
        let mut cons = ring.req_cons();
        while cons != bad.end {
            let txp = ring.request(cons).request();
            queue_response(&mut ring, txp.id, NetifStatus::Error, 0);
            cons = cons.wrapping_add(1);
        }
        ring.set_req_cons(bad.end);
        if ring.push_responses_and_check_notify() {
            self.shared.hv.notify(netif.evtchn());
        }
        drop(ring);
        self.schedule_work(netif.arc());
    }

    /// Turns mapped requests into packets and hands them to the sink.
    fn tx_submit(&self, st: &mut TxState) {
        let mut ready = Vec::new();
        {
            let mut pool = lock(&self.pool);
            let mut cursor = 0;
            while let Some(nascent) = st.nascent.pop_front() {
                if !self.tx_check_mop(&mut pool, &nascent, st.map_ops.as_slice(), &mut cursor) {
                    continue;
                }
                if let Some(packet) = self.tx_assemble(&mut pool, &nascent) {
                    ready.push((nascent.netif.id(), packet));
                }
            }
        }

        for (from, packet) in ready {
            let packet = if self.shared.copy_mode == CopyMode::Always {
                // Linearising drops the foreign pages and releases their slots.
                match packet.copy_to_local() {
                    Some(copy) => copy,
                    None => {
                        warn!("{}: dropping packet that does not fit locally", from);
                        continue;
                    }
                }
            } else {
                packet
            };
            self.shared.sink.deliver(from, packet);
        }
    }

    /// Records map results for one packet. A failed map answers its request
    /// with ERROR and frees the slot; once any map of the packet failed,
    /// every mapped sibling is invalidated and goes through the dealloc path
    /// with an ERROR status.
    fn tx_check_mop(
        &self,
        pool: &mut PendingPool,
        nascent: &Nascent,
        ops: &[MapOp],
        cursor: &mut usize,
    ) -> bool {
        let mut failed = false;
        let mut mapped = Vec::new();
        let rest = if nascent.head_in_frags() {
            &nascent.frags[1..]
        } else {
            &nascent.frags[..]
        };
        for &idx in std::iter::once(&nascent.head).chain(rest) {
            let op = &ops[*cursor];
            *cursor += 1;
            if op.status.is_ok() {
                pool.set_handle(idx, op.handle);
                if failed {
                    self.invalidate_slot(pool, idx);
                } else {
                    mapped.push(idx);
                }
                continue;
            }
            debug!(
                "{}: map of grant {} failed: {:?}",
                nascent.netif.id(),
                op.gref,
                op.status
            );
            self.fail_slot(pool, idx);
            if !failed {
                for sibling in mapped.drain(..) {
                    self.invalidate_slot(pool, sibling);
                }
                failed = true;
            }
        }
        if failed {
            InterfaceStats::add(&nascent.netif.stats().tx_errors, 1);
        }
        !failed
    }

    /// The slot never got mapped: answer now and put it back.
    fn fail_slot(&self, pool: &mut PendingPool, idx: u16) {
        if let Some(pending) = pool.take_pending(idx) {
            self.make_tx_response(
                &pending.netif,
                pending.req.id,
                NetifStatus::Error,
                pending.extra_slots,
            );
        }
        pool.release(idx);
    }

    /// The slot is mapped but its packet is dead: unmap and answer ERROR
    /// through the dealloc path.
    fn invalidate_slot(&self, pool: &mut PendingPool, idx: u16) {
        if let Some(pending) = pool.pending_mut(idx) {
            pending.status = NetifStatus::Error;
        }
        (self.release_hook)(idx);
    }

    fn tx_assemble(&self, pool: &mut PendingPool, nascent: &Nascent) -> Option<Packet> {
        let netif = &nascent.netif;
        let (head_req, head_page) = match pool.pending(nascent.head) {
            Some(pending) => (pending.req, pool.page(nascent.head).clone()),
            None => return None,
        };

        let header = head_page.to_vec(head_req.offset as usize, nascent.header_len);
        let mut packet = Packet {
            head: Fragment::local(Page::with_data(0, &header), 0, header.len()),
            frags: Vec::with_capacity(nascent.frags.len()),
            checksum: Checksum::None,
            gso: nascent.gso,
        };

        if head_req.has_flag(NETTXF_CSUM_BLANK) {
            packet.checksum = Checksum::Partial;
        } else if head_req.has_flag(NETTXF_DATA_VALIDATED) {
            packet.checksum = Checksum::Unnecessary;
        }

        if nascent.head_in_frags() {
            if let Some(pending) = pool.pending_mut(nascent.head) {
                pending.req.offset += nascent.header_len as u16;
                pending.req.size -= nascent.header_len as u16;
            }
        } else {
            // Everything is in the header; the slot is done.
            (self.release_hook)(nascent.head);
        }

        let now = self.now();
        for &idx in &nascent.frags {
            let Some(req) = pool.pending(idx).map(|p| p.req) else {
                continue;
            };
            let origin = GrantOrigin {
                domid: netif.domid(),
                gref: req.gref,
            };
            let (foreign, lease) =
                ForeignPage::new(pool.page(idx).clone(), idx, origin, self.release_hook.clone());
            pool.lend(idx, lease, now);
            packet.frags.push(Fragment {
                page: FragPage::Foreign(foreign),
                offset: req.offset as usize,
                size: req.size as usize,
            });
        }

        InterfaceStats::add(&netif.stats().tx_packets, 1);
        InterfaceStats::add(&netif.stats().tx_bytes, packet.len() as u64);
        Some(packet)
    }

    fn make_tx_response(
        &self,
        netif: &Interface,
        id: u16,
        status: NetifStatus,
        extra_slots: u8,
    ) {
        let mut ring = lock(&netif.tx);
        queue_response(&mut ring, id, status, extra_slots);
        if ring.push_responses_and_check_notify() {
            self.shared.hv.notify(netif.evtchn());
        }
    }

    /// Unmaps released slots in one call, answers their requests and puts
    /// them back on the free ring. In delayed-copy mode, pages lent for too
    /// long are copied out first.
    fn tx_action_dealloc(&self, st: &mut TxState) -> Result<()> {
        self.tx_pending_due.store(false, Ordering::Release);
        let mut pool = lock(&self.pool);
        st.unmap_ops.clear();
        st.released.clear();

        loop {
            st.drained.clear();
            self.dealloc.drain_into(&mut st.drained);
            if self.shared.permute_returns {
                st.permuter.permute(&mut st.drained);
            }
            for &idx in &st.drained {
                pool.untrack(idx);
                if let Some(handle) = pool.take_handle(idx) {
                    st.unmap_ops.push(UnmapOp {
                        handle,
                        host: pool.page(idx).clone(),
                        status: Default::default(),
                    });
                }
                st.released.push(idx);
            }

            if self.shared.copy_mode != CopyMode::Delayed {
                break;
            }
            let Some(due) = self.now().checked_sub(COPY_DELAY) else {
                break;
            };
            for idx in pool.inuse_since(due) {
                match self.copy_out(&mut pool, idx) {
                    PageCopy::Copied => {
                        pool.untrack(idx);
                        st.released.push(idx);
                    }
                    PageCopy::Busy => pool.untrack(idx),
                    PageCopy::Retry => {}
                }
            }
            if !self.dealloc.has_pending() {
                break;
            }
        }

        batch::execute_unmap(&*self.shared.hv, &mut st.unmap_ops)?;

        for &idx in &st.released {
            if let Some(pending) = pool.take_pending(idx) {
                self.make_tx_response(
                    &pending.netif,
                    pending.req.id,
                    pending.status,
                    pending.extra_slots,
                );
            }
            pool.release(idx);
        }
        st.released.clear();
        Ok(())
    }

    /// Replaces a lent page with a private copy so the slot can be reused.
    fn copy_out(&self, pool: &mut PendingPool, idx: u16) -> PageCopy {
        let Some(lease) = pool.lease(idx) else {
            // Already released; the dealloc ring has it.
            return PageCopy::Retry;
        };
        let Some(handle) = pool.handle(idx) else {
            return PageCopy::Busy;
        };
        let outcome = self.shared.hv.copy_grant_page(handle, lease.page());
        if outcome == PageCopy::Copied {
            lease.detach();
            pool.take_handle(idx);
            pool.replace_page(idx);
            if let Some(pending) = pool.pending(idx) {
                InterfaceStats::add(&pending.netif.stats().copied_pages, 1);
            }
        }
        drop(lease);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::grant::GrantStatus;
    use crate::netif::{ConnectRequest, CreditLimit, InterfaceId};
    use crate::partition::tests::{Harness, harness, harness_with};
    use crate::protocol::{NET_RX_RING_SIZE, NET_TX_RING_SIZE, TxSlot};
    use crate::ring::{RxSharedRing, TxFrontRing, TxSharedRing};
    use crate::time::Clock;

    struct Guest {
        domid: u16,
        front: TxFrontRing,
        netif: Arc<Interface>,
    }

    fn guest(h: &Harness, domid: u16, credit: Option<CreditLimit>) -> Guest {
        let tx_ring = TxSharedRing::new(NET_TX_RING_SIZE);
        let req = ConnectRequest {
            id: InterfaceId { domid, handle: 0 },
            tx_ring: tx_ring.clone(),
            rx_ring: RxSharedRing::new(NET_RX_RING_SIZE),
            evtchn: 100 + domid as u32,
            copying_receiver: true,
            can_queue: true,
            scatter_gather: true,
            tso: true,
            credit,
        };
        let netif = Interface::new(&req, 32, h.clock.now());
        netif.set_carrier(true);
        netif.set_up(true);
        Guest {
            domid,
            front: TxFrontRing::new(tx_ring),
            netif,
        }
    }

    impl Guest {
        fn push(&mut self, h: &Harness, slots: &[TxSlot]) {
            for slot in slots {
                self.front.push_request(*slot).unwrap();
            }
            self.front.push_requests_and_check_notify();
            h.partition.interrupt(&self.netif);
        }

        fn responses(&mut self) -> Vec<TxResponse> {
            std::iter::from_fn(|| self.front.pop_response()).collect()
        }

        fn request(&self, h: &Harness, id: u16, data: &[u8], size: usize, flags: u16) -> TxSlot {
            let gref = h.hv.grant_access(self.domid, Page::with_data(0, data), true);
            TxSlot::Request(TxRequest {
                gref,
                offset: 0,
                flags,
                id,
                size: size as u16,
            })
        }
    }

    fn frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_single_fragment_ok() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let data = frame(60);
        let req = g.request(&h, 7, &data, 60, 0);
        g.push(&h, &[req]);

        h.partition.run_until_idle().unwrap();
        let delivered = h.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, g.netif.id());
        assert_eq!(delivered[0].1.to_vec(), data);
        assert_eq!(delivered[0].1.nr_frags(), 0);
        drop(delivered);

        let rsp = g.responses();
        assert_eq!(rsp, vec![TxResponse { id: 7, status: 0 }]);
        assert_eq!(h.partition.pending_slots(), 0);
        assert_eq!(h.hv.mapped_count(), 0);
    }

    #[test]
    fn test_large_packet_splits_header_and_lends_page() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let data = frame(1500);
        let req = g.request(&h, 1, &data, 1500, NETTXF_CSUM_BLANK);
        g.push(&h, &[req]);
        h.partition.run_until_idle().unwrap();

        let (_, packet) = h.delivered.lock().unwrap().pop().unwrap();
        assert_eq!(packet.head.size, PKT_PROT_LEN);
        assert_eq!(packet.nr_frags(), 1);
        assert_eq!(packet.checksum, Checksum::Partial);
        assert_eq!(packet.to_vec(), data);
        // The stack still holds the page, so the slot is still lent.
        assert!(g.responses().is_empty());
        assert_eq!(h.partition.pending_slots(), 1);

        drop(packet);
        h.partition.run_until_idle().unwrap();
        assert_eq!(g.responses(), vec![TxResponse { id: 1, status: 0 }]);
        assert_eq!(h.partition.pending_slots(), 0);
    }

    #[test]
    fn test_page_crossing_request_rejected_without_slot() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let gref = h.hv.grant_access(1, Page::new(), true);
        let req = TxSlot::Request(TxRequest {
            gref,
            offset: 4000,
            flags: 0,
            id: 3,
            size: 200,
        });
        g.push(&h, &[req]);
        h.partition.run_until_idle().unwrap();

        assert_eq!(g.responses(), vec![TxResponse { id: 3, status: -1 }]);
        assert_eq!(h.hv.counters().map_calls, 0);
        assert_eq!(h.partition.pending_slots(), 0);
        assert!(h.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_short_packet_rejected() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let req = g.request(&h, 4, &frame(10), 10, 0);
        g.push(&h, &[req]);
        h.partition.run_until_idle().unwrap();
        assert_eq!(g.responses(), vec![TxResponse { id: 4, status: -1 }]);
        assert_eq!(g.netif.stats().snapshot().tx_errors, 1);
    }

    #[test]
    fn test_partial_map_failure_answers_every_slot() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let data = frame(3000);
        let head = g.request(&h, 10, &data[..1000], 3000, NETTXF_MORE_DATA);
        let f1 = g.request(&h, 11, &data[1000..2000], 1000, NETTXF_MORE_DATA);
        let f2 = g.request(&h, 12, &data[2000..], 1000, 0);
        let TxSlot::Request(bad) = f2 else { unreachable!() };
        h.hv.fail_map(1, bad.gref, GrantStatus::GeneralError);
        g.push(&h, &[head, f1, f2]);

        h.partition.run_until_idle().unwrap();
        let mut rsp = g.responses();
        rsp.sort_by_key(|r| r.id);
        assert_eq!(
            rsp,
            vec![
                TxResponse { id: 10, status: -1 },
                TxResponse { id: 11, status: -1 },
                TxResponse { id: 12, status: -1 },
            ]
        );
        assert!(h.delivered.lock().unwrap().is_empty());
        assert_eq!(h.partition.pending_slots(), 0);
        assert_eq!(h.hv.mapped_count(), 0);
        assert!(lock(&h.partition.pool).check_accounting());
    }

    #[test]
    fn test_multi_fragment_packet() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let data = frame(2500);
        let head = g.request(&h, 20, &data[..1000], 2500, NETTXF_MORE_DATA);
        let f1 = g.request(&h, 21, &data[1000..], 1500, 0);
        g.push(&h, &[head, f1]);
        h.partition.run_until_idle().unwrap();

        let (_, packet) = h.delivered.lock().unwrap().pop().unwrap();
        assert_eq!(packet.to_vec(), data);
        assert_eq!(packet.nr_frags(), 2);
        drop(packet);
        h.partition.run_until_idle().unwrap();
        let mut ids: Vec<u16> = g.responses().iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec![20, 21]);
    }

    #[test]
    fn test_gso_extra_is_answered_with_null() {
        let h = harness(CopyMode::Always);
        let mut g = guest(&h, 1, None);
        let req = g.request(&h, 5, &frame(200), 200, NETTXF_EXTRA_INFO);
        g.push(&h, &[req, TxSlot::Extra(ExtraInfo::gso(1448))]);
        h.partition.run_until_idle().unwrap();

        let (_, packet) = h.delivered.lock().unwrap().pop().unwrap();
        assert_eq!(packet.gso.map(|g| g.size), Some(1448));
        h.partition.run_until_idle().unwrap();
        assert_eq!(
            g.responses(),
            vec![
                TxResponse { id: 5, status: 0 },
                TxResponse {
                    id: 0,
                    status: NetifStatus::Null.code()
                },
            ]
        );
    }

    #[test]
    fn test_bad_extra_type_consumes_slot() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let req = g.request(&h, 6, &frame(200), 200, NETTXF_EXTRA_INFO);
        let bad = TxSlot::Extra(ExtraInfo::default());
        let next = g.request(&h, 7, &frame(60), 60, 0);
        g.push(&h, &[req, bad, next]);
        h.partition.run_until_idle().unwrap();

        let rsp = g.responses();
        assert_eq!(rsp[0], TxResponse { id: 6, status: -1 });
        assert_eq!(rsp[1].status, NetifStatus::Null.code());
        // The ring did not wedge: the following packet went through.
        assert_eq!(rsp[2], TxResponse { id: 7, status: 0 });
        assert_eq!(h.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_fragment_is_rejected() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let req = g.request(&h, 8, &frame(100), 100, NETTXF_MORE_DATA);
        g.push(&h, &[req]);
        h.partition.run_until_idle().unwrap();
        assert_eq!(g.responses(), vec![TxResponse { id: 8, status: -1 }]);
        assert_eq!(h.partition.pending_slots(), 0);
    }

    #[test]
    fn test_credit_limits_and_arms_one_timer() {
        let h = harness(CopyMode::Always);
        let limit = CreditLimit {
            bytes: 1000,
            usec: 1_000_000,
        };
        let mut g = guest(&h, 1, Some(limit));
        let slots: Vec<TxSlot> = (0..5).map(|id| g.request(&h, id, &frame(300), 300, 0)).collect();
        g.push(&h, &slots);
        h.partition.run_until_idle().unwrap();

        assert_eq!(h.delivered.lock().unwrap().len(), 3);
        assert_eq!(h.partition.credit_timers(&g.netif), 1);
        // The timer reschedules the interface, not the schedule list.
        assert_eq!(h.partition.scheduled(), 0);
        // Another notification must not arm a second timer.
        h.partition.interrupt(&g.netif);
        h.partition.run_until_idle().unwrap();
        assert_eq!(h.delivered.lock().unwrap().len(), 3);
        assert_eq!(h.partition.credit_timers(&g.netif), 1);

        h.clock.advance(Duration::from_secs(1));
        h.partition.run_until_idle().unwrap();
        assert_eq!(h.delivered.lock().unwrap().len(), 5);
        assert_eq!(g.responses().len(), 5);
    }

    #[test]
    fn test_delayed_copy_releases_held_slot() {
        let h = harness(CopyMode::Delayed);
        h.hv.set_unmap_and_replace(true, PageCopy::Copied);
        let mut g = guest(&h, 1, None);
        let data = frame(1500);
        let req = g.request(&h, 9, &data, 1500, 0);
        g.push(&h, &[req]);
        h.partition.run_until_idle().unwrap();
        assert_eq!(h.partition.pending_slots(), 1);
        assert!(h.partition.next_timeout().is_some());

        h.clock.advance(Duration::from_secs(1));
        h.partition.run_until_idle().unwrap();
        assert_eq!(g.responses(), vec![TxResponse { id: 9, status: 0 }]);
        assert_eq!(h.partition.pending_slots(), 0);
        assert_eq!(g.netif.stats().snapshot().copied_pages, 1);

        // The packet kept its data and dropping it releases nothing twice.
        let (_, packet) = h.delivered.lock().unwrap().pop().unwrap();
        assert_eq!(packet.to_vec(), data);
        drop(packet);
        h.partition.run_until_idle().unwrap();
        assert!(!h.partition.dealloc.has_pending());
        assert!(lock(&h.partition.pool).check_accounting());
    }

    #[test]
    fn test_pool_headroom_stops_consumption() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let slots: Vec<TxSlot> = (0..250)
            .map(|id| g.request(&h, id, &frame(1000), 1000, 0))
            .collect();
        g.push(&h, &slots);
        h.partition.run_until_idle().unwrap();
        let held = h.delivered.lock().unwrap().len();
        assert_eq!(held, MAX_PENDING_REQS - MAX_SKB_FRAGS);
        assert!(h.partition.pending_slots() + MAX_SKB_FRAGS >= MAX_PENDING_REQS);

        h.delivered.lock().unwrap().clear();
        h.partition.run_until_idle().unwrap();
        assert_eq!(h.delivered.lock().unwrap().len(), 250 - held);
    }

    fn slot_at(h: &Harness, domid: u16, id: u16, offset: u16, size: u16, flags: u16) -> TxSlot {
        let gref = h.hv.grant_access(domid, Page::new(), true);
        TxSlot::Request(TxRequest {
            gref,
            offset,
            flags,
            id,
            size,
        })
    }

    fn statuses(rsp: &[TxResponse]) -> Vec<(u16, i16)> {
        rsp.iter().map(|r| (r.id, r.status)).collect()
    }

    #[test]
    fn test_bad_gso_answers_whole_chain() {
        let zero_size = ExtraInfo::gso(0);
        let mut bad_kind = ExtraInfo::gso(1448);
        bad_kind.gso.kind = XEN_NETIF_GSO_TYPE_TCPV4 + 1;

        for extra in [zero_size, bad_kind] {
            let h = harness(CopyMode::None);
            let mut g = guest(&h, 1, None);
            let head = g.request(
                &h,
                30,
                &frame(100),
                300,
                NETTXF_EXTRA_INFO | NETTXF_MORE_DATA,
            );
            let f1 = g.request(&h, 31, &frame(100), 100, NETTXF_MORE_DATA);
            let f2 = g.request(&h, 32, &frame(100), 100, 0);
            let next = g.request(&h, 33, &frame(60), 60, 0);
            g.push(&h, &[head, TxSlot::Extra(extra), f1, f2, next]);
            h.partition.run_until_idle().unwrap();

            let null = NetifStatus::Null.code();
            assert_eq!(
                statuses(&g.responses()),
                vec![(30, -1), (0, null), (31, -1), (32, -1), (33, 0)]
            );
            assert_eq!(lock(&g.netif.tx).req_cons(), 5);
            let delivered = h.delivered.lock().unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].1.to_vec(), frame(60));
        }
    }

    #[test]
    fn test_fragment_crossing_page_rejected() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let head = g.request(&h, 10, &frame(100), 400, NETTXF_MORE_DATA);
        let f1 = slot_at(&h, 1, 11, 4000, 200, NETTXF_MORE_DATA);
        let f2 = slot_at(&h, 1, 12, 0, 100, 0);
        g.push(&h, &[head, f1, f2]);
        h.partition.run_until_idle().unwrap();

        assert_eq!(statuses(&g.responses()), vec![(10, -1), (11, -1), (12, -1)]);
        assert_eq!(lock(&g.netif.tx).req_cons(), 3);
        assert_eq!(h.hv.counters().map_calls, 0);
        assert!(h.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_too_many_fragments_rejected() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let nr = MAX_SKB_FRAGS + 1;
        let mut slots = vec![g.request(&h, 0, &frame(100), 100 * (nr + 1), NETTXF_MORE_DATA)];
        for id in 1..=nr {
            let flags = if id < nr { NETTXF_MORE_DATA } else { 0 };
            slots.push(g.request(&h, id as u16, &frame(100), 100, flags));
        }
        g.push(&h, &slots);
        h.partition.run_until_idle().unwrap();

        let rsp = g.responses();
        assert_eq!(rsp.len(), nr + 1);
        assert!(rsp.iter().all(|r| r.status == -1));
        assert_eq!(lock(&g.netif.tx).req_cons(), nr as u32 + 1);
        assert_eq!(h.hv.counters().map_calls, 0);
        assert!(h.delivered.lock().unwrap().is_empty());
        assert_eq!(g.netif.stats().snapshot().tx_errors, 1);
    }

    #[test]
    fn test_fragment_larger_than_packet_rejected() {
        let h = harness(CopyMode::None);
        let mut g = guest(&h, 1, None);
        let head = g.request(&h, 40, &frame(100), 150, NETTXF_MORE_DATA);
        let f1 = g.request(&h, 41, &frame(200), 200, 0);
        let next = g.request(&h, 42, &frame(60), 60, 0);
        g.push(&h, &[head, f1, next]);
        h.partition.run_until_idle().unwrap();

        assert_eq!(statuses(&g.responses()), vec![(40, -1), (41, -1), (42, 0)]);
        assert_eq!(h.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_permuted_returns_answer_every_slot() {
        let h = harness_with(CopyMode::None, true);
        let mut g = guest(&h, 1, None);
        let slots: Vec<TxSlot> = (0..8)
            .map(|id| g.request(&h, id, &frame(1500), 1500, 0))
            .collect();
        g.push(&h, &slots);
        h.partition.run_until_idle().unwrap();
        assert_eq!(h.partition.pending_slots(), 8);

        // Release every page in packet order, then answer them in one pass.
        h.delivered.lock().unwrap().clear();
        h.partition.run_until_idle().unwrap();

        let ids: Vec<u16> = g.responses().iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, (0..8).collect::<Vec<u16>>());
        assert_ne!(ids, sorted);
        assert_eq!(h.partition.pending_slots(), 0);
        assert_eq!(h.hv.mapped_count(), 0);
        assert!(lock(&h.partition.pool).check_accounting());
    }
}
