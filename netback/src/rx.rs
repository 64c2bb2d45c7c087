// SPDX-License-Identifier: Apache-2.0

//! Guest receive path: packets from the host stack are copied or transferred
//! into buffers the guest posted on its receive ring.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;

use log::{debug, warn};

use crate::batch::{self, OpBuffer, RxMeta};
use crate::grant::{
    CopyOp, CopySource, EventChannel, GrantStatus, Hypervisor, MmuUpdate, MultiCallEntry,
    MultiCallOp, TransferOp,
};
use crate::netif::{Interface, InterfaceStats};
use crate::packet::{Checksum, Fragment, Packet};
use crate::page::Mfn;
use crate::partition::{Partition, QueuedPacket};
use crate::protocol::{
    ExtraInfo, MAX_MFN_ALLOC, MAX_SKB_FRAGS, NET_RX_RING_SIZE, NETRXF_CSUM_BLANK,
    NETRXF_DATA_VALIDATED, NETRXF_EXTRA_INFO, NETRXF_MORE_DATA, NetifStatus, RxRequest,
    RxResponse, RxSlot,
};
use crate::ring::RxBackRing;
use crate::time::Timer;
use crate::{Error, Result, lock};

/// How long a stopped queue waits for guest buffers before retrying.
const QUEUE_TIMEOUT: Duration = Duration::from_millis(500);
/// Delay before retrying after frame reservation failed.
const RX_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum XmitOutcome {
    Queued,
    /// The queue is stopped; the packet waits in the interface backlog.
    Backlogged,
    Dropped,
}

/// Machine frames reserved for page transfers.
#[derive(Default)]
struct FramePool {
    mfns: Vec<Mfn>,
}

impl FramePool {
    /// Makes sure `needed` frames are at hand, topping up in one request.
    fn ensure(&mut self, hv: &dyn Hypervisor, needed: usize) -> bool {
        if self.mfns.len() < needed {
            let want = MAX_MFN_ALLOC.saturating_sub(self.mfns.len());
            self.mfns.extend(hv.increase_reservation(want));
        }
        self.mfns.len() >= needed
    }

    fn take(&mut self) -> Mfn {
        match self.mfns.pop() {
            Some(mfn) => mfn,
            None => panic!("frame pool drained after reservation check"),
        }
    }
}

pub(crate) struct RxState {
    batch: batch::RxBatch,
    frames: FramePool,
    notify: Vec<EventChannel>,
    notify_mcl: OpBuffer<MultiCallEntry>,
}

impl Default for RxState {
    fn default() -> Self {
        RxState {
            batch: batch::RxBatch::default(),
            frames: FramePool::default(),
            notify: Vec::with_capacity(NET_RX_RING_SIZE),
            notify_mcl: OpBuffer::with_capacity("notify", NET_RX_RING_SIZE),
        }
    }
}

fn rx_slots(packet: &Packet) -> u32 {
    packet.nr_frags() as u32 + 1 + u32::from(packet.gso.is_some())
}

fn push_rx_response(
    ring: &mut RxBackRing,
    id: u16,
    status: NetifStatus,
    offset: u16,
    size: u16,
    flags: u16,
) {
    let status = match status {
        NetifStatus::Okay => size as i16,
        other => other.code(),
    };
    ring.push_response(RxSlot::Response(RxResponse {
        id,
        offset,
        flags,
        status,
    }));
}

impl Partition {
    /// Queues `packet` for delivery to `netif`.
    pub(crate) fn start_xmit(&self, netif: &Arc<Interface>, packet: Packet) -> XmitOutcome {
        if netif.queue_stopped() {
            if netif.backlog_push(packet) {
                return XmitOutcome::Backlogged;
            }
            InterfaceStats::add(&netif.stats().rx_dropped, 1);
            return XmitOutcome::Dropped;
        }
        self.xmit(netif, packet)
    }

    fn drop_packet(&self, netif: &Interface, why: &str) -> XmitOutcome {
        debug!("{}: dropping packet: {}", netif.id(), why);
        InterfaceStats::add(&netif.stats().rx_dropped, 1);
        XmitOutcome::Dropped
    }

    fn xmit(&self, netif: &Arc<Interface>, mut packet: Packet) -> XmitOutcome {
        if !netif.is_schedulable() {
            return self.drop_packet(netif, "interface down");
        }
        if netif.rx_queue_full() {
            return self.drop_packet(netif, "receive ring full");
        }

        if !netif.scatter_gather() && packet.nr_frags() > 0 {
            match packet.linearize() {
                Some(linear) => packet = linear,
                None => return self.drop_packet(netif, "fragmented packet without scatter-gather"),
            }
        }
        if !netif.tso() {
            packet.gso = None;
        }
        // Transferred pages must be ours to give away, the head must fit one
        // guest buffer and the fragments must fit the reserved ring slots.
        if !netif.copying_receiver()
            || packet.header_crosses_page()
            || packet.nr_frags() > MAX_SKB_FRAGS
        {
            match packet.copy_to_local() {
                Some(copy) => packet = copy,
                None => return self.drop_packet(netif, "packet too large to copy"),
            }
        }

        netif
            .rx_req_cons_peek
            .fetch_add(rx_slots(&packet), Ordering::AcqRel);

        if netif.can_queue() {
            let rx = lock(&netif.rx);
            if netif.rx_queue_full_locked(&rx) {
                let peek = netif.rx_req_cons_peek.load(Ordering::Acquire);
                rx.shared()
                    .set_req_event(peek.wrapping_add(netif.max_required_rx_slots()));
                fence(Ordering::SeqCst);
                if netif.rx_queue_full_locked(&rx) {
                    drop(rx);
                    netif.stop_queue();
                    debug!("{}: receive queue stopped", netif.id());
                    self.arm_timer(self.now() + QUEUE_TIMEOUT, Timer::QueueTimeout(netif.get()));
                }
            }
        }

        lock(&self.rx_queue).push_back(QueuedPacket {
            netif: netif.get(),
            packet,
        });
        self.waker.wake();
        XmitOutcome::Queued
    }

    /// Restarts a stopped queue and feeds it the backlog.
    pub(crate) fn wake_queue(&self, netif: &Arc<Interface>) {
        if !netif.start_queue() {
            return;
        }
        debug!("{}: receive queue woken", netif.id());
        loop {
            if netif.queue_stopped() {
                break;
            }
            let Some(packet) = lock(&netif.backlog).pop_front() else {
                break;
            };
            let _ = self.xmit(netif, packet);
        }
    }

    /// Drops every queued packet bound for `netif`, releasing the references
    /// they hold.
    pub(crate) fn purge_rx_queue(&self, netif: &Interface) {
        let mut purged = 0;
        lock(&self.rx_queue).retain(|qp| {
            let keep = !std::ptr::eq(&*qp.netif, netif);
            purged += usize::from(!keep);
            keep
        });
        if purged > 0 {
            debug!("{}: purged {} queued packet(s)", netif.id(), purged);
            InterfaceStats::add(&netif.stats().rx_dropped, purged as u64);
        }
    }

    fn gop_frag(&self, st: &mut RxState, netif: &Interface, req: RxRequest, frag: &Fragment) -> RxMeta {
        let page = frag.page.page();
        let meta = RxMeta {
            id: req.id,
            offset: frag.offset as u16,
            size: frag.size as u16,
            copy: netif.copying_receiver(),
            gso_size: 0,
        };
        if netif.copying_receiver() {
            let source = match frag.page.grant_origin() {
                Some(origin) => CopySource::Grant {
                    domid: origin.domid,
                    gref: origin.gref,
                },
                None => CopySource::Local {
                    mfn: self.shared.p2m.mfn(page.pfn()),
                    page: page.clone(),
                },
            };
            st.batch.copies.push(CopyOp {
                source,
                source_offset: frag.offset,
                dest_domid: netif.domid(),
                dest_gref: req.gref,
                dest_offset: 0,
                len: frag.size,
                status: GrantStatus::Okay,
            });
        } else {
            let pfn = page.pfn();
            let old_mfn = self.shared.p2m.mfn(pfn);
            let new_mfn = st.frames.take();
            self.shared.p2m.set(pfn, new_mfn);
            st.batch.mcl.push(MultiCallEntry::new(MultiCallOp::UpdateVaMapping {
                pfn,
                mfn: new_mfn,
                flush_tlb: false,
            }));
            st.batch.mmu.push(MmuUpdate { mfn: new_mfn, pfn });
            st.batch.transfers.push(TransferOp {
                mfn: old_mfn,
                page: page.clone(),
                domid: netif.domid(),
                gref: req.gref,
                status: GrantStatus::Okay,
            });
        }
        meta
    }

    /// Queues the operations for one packet. The head is placed last; its
    /// metadata entry is reserved first.
    fn gop_packet(&self, st: &mut RxState, qp: &QueuedPacket) {
        let netif = &qp.netif;
        let packet = &qp.packet;
        let mut ring = lock(&netif.rx);
        let cons = ring.req_cons();
        let extra = 1 + u32::from(packet.gso.is_some());

        let head_idx = st.batch.meta.push(RxMeta::default());
        for (i, frag) in packet.frags.iter().enumerate() {
            let req = ring.request(cons.wrapping_add(extra + i as u32));
            let meta = self.gop_frag(st, netif, req, frag);
            st.batch.meta.push(meta);
        }
        let mut head = self.gop_frag(st, netif, ring.request(cons), &packet.head);
        head.gso_size = packet.gso.map_or(0, |gso| gso.size);
        st.batch.meta[head_idx] = head;

        ring.set_req_cons(cons.wrapping_add(rx_slots(packet)));
    }

    pub(crate) fn net_rx_action(&self) -> Result<()> {
        let mut guard = lock(&self.rx_state);
        let st = &mut *guard;
        st.batch.clear();

        let mut taken = Vec::new();
        let mut count = 0;
        loop {
            let Some(qp) = lock(&self.rx_queue).pop_front() else {
                break;
            };
            let nr_frags = qp.packet.nr_frags();
            if !qp.netif.copying_receiver() && !st.frames.ensure(&*self.shared.hv, nr_frags + 1) {
                warn!("memory squeeze in netback driver");
                lock(&self.rx_queue).push_front(qp);
                self.arm_timer(self.now() + RX_RETRY_DELAY, Timer::RxRetry);
                break;
            }
            self.gop_packet(st, &qp);
            count += nr_frags + 1;
            taken.push(qp);
            if count + MAX_SKB_FRAGS >= NET_RX_RING_SIZE {
                break;
            }
        }
        if taken.is_empty() {
            return Ok(());
        }

        st.batch.execute(&*self.shared.hv)?;

        st.notify.clear();
        let mut requeue = Vec::new();
        for qp in taken {
            let netif = &qp.netif;
            let packet = &qp.packet;
            let nr_frags = packet.nr_frags();
            let outcome = st.batch.check_packet(nr_frags);
            if outcome.eagain && !netif.copying_receiver() {
                return Err(Error::UnrecoverableTransfer {
                    interface: netif.id(),
                });
            }
            if let Some(status) = outcome.first_error {
                debug!("{}: receive operation failed: {:?}", netif.id(), status);
            }

            let head = st.batch.meta[st.batch.meta_cons];
            let mut flags = match packet.checksum {
                Checksum::Partial => NETRXF_CSUM_BLANK | NETRXF_DATA_VALIDATED,
                Checksum::Unnecessary => NETRXF_DATA_VALIDATED,
                Checksum::None => 0,
            };
            if nr_frags > 0 {
                flags |= NETRXF_MORE_DATA;
            }
            if head.gso_size != 0 {
                flags |= NETRXF_EXTRA_INFO;
            }

            let notify = {
                let mut ring = lock(&netif.rx);
                let offset = if head.copy { 0 } else { head.offset };
                push_rx_response(&mut ring, head.id, outcome.status, offset, head.size, flags);
                if head.gso_size != 0 {
                    ring.push_response(RxSlot::Extra(ExtraInfo::gso(head.gso_size)));
                }
                for i in 0..nr_frags {
                    let meta = st.batch.meta[st.batch.meta_cons + 1 + i];
                    let flags = if i + 1 < nr_frags { NETRXF_MORE_DATA } else { 0 };
                    let offset = if meta.copy { 0 } else { meta.offset };
                    push_rx_response(&mut ring, meta.id, outcome.status, offset, meta.size, flags);
                }
                ring.push_responses_and_check_notify()
            };
            st.batch.meta_cons += nr_frags + 1;

            if notify && !st.notify.contains(&netif.evtchn()) {
                st.notify.push(netif.evtchn());
            }
            if netif.queue_stopped() && netif.is_schedulable() && !netif.rx_queue_full() {
                self.wake_queue(netif.arc());
            }

            if outcome.status == NetifStatus::Okay {
                InterfaceStats::add(&netif.stats().rx_packets, 1);
                InterfaceStats::add(&netif.stats().rx_bytes, packet.len() as u64);
            }
            if outcome.eagain && !netif.rx_queue_full() {
                netif
                    .rx_req_cons_peek
                    .fetch_add(rx_slots(packet), Ordering::AcqRel);
                requeue.push(qp);
            } else if outcome.status != NetifStatus::Okay {
                InterfaceStats::add(&netif.stats().rx_dropped, 1);
            }
        }

        if !requeue.is_empty() {
            let mut queue = lock(&self.rx_queue);
            for qp in requeue.into_iter().rev() {
                queue.push_front(qp);
            }
        }

        batch::execute_notify(&*self.shared.hv, &st.notify, &mut st.notify_mcl)?;

        if !lock(&self.rx_queue).is_empty() && !lock(&self.timers).rx_retry_pending() {
            self.waker.wake();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emul::EmulatedHypervisor;
    use crate::frontend::Frontend;
    use crate::page::Page;
    use crate::partition::CopyMode;
    use crate::partition::tests::{Harness, harness};
    use crate::protocol::{GsoInfo, PAGE_SIZE};
    use crate::time::Clock;

    fn attach(h: &Harness, fe: &Frontend) -> Arc<Interface> {
        let netif = Interface::new(&fe.connect_request(0, None), 32, h.clock.now());
        netif.set_carrier(true);
        netif.set_up(true);
        netif
    }

    fn frontend(hv: &Arc<EmulatedHypervisor>, domid: u16, flip: bool) -> Frontend {
        Frontend::new(hv.clone(), domid, 40 + domid as u32, flip)
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_copy_delivery_and_single_notify() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 2, false);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(64);

        for seed in 0..5 {
            let out = h.partition.start_xmit(&netif, Packet::from_bytes(&payload(60, seed)));
            assert_eq!(out, XmitOutcome::Queued);
        }
        h.partition.run_until_idle().unwrap();

        assert_eq!(h.hv.notifications(fe.evtchn()), 1);
        let got = fe.receive();
        assert_eq!(got.len(), 5);
        for (seed, pkt) in got.iter().enumerate() {
            assert_eq!(pkt.data, payload(60, seed as u8));
            assert_eq!(pkt.error, None);
        }
        assert_eq!(netif.stats().snapshot().rx_packets, 5);
    }

    #[test]
    fn test_fragments_gso_and_checksum_flags() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 2, false);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(64);

        let data = payload(10000, 3);
        let mut packet = Packet::from_bytes(&data);
        packet.checksum = Checksum::Partial;
        packet.gso = Some(GsoInfo {
            size: 1448,
            kind: crate::protocol::XEN_NETIF_GSO_TYPE_TCPV4,
            pad: 0,
            features: 0,
        });
        assert_eq!(h.partition.start_xmit(&netif, packet), XmitOutcome::Queued);
        h.partition.run_until_idle().unwrap();

        let got = fe.receive();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, data);
        assert_eq!(got[0].gso.map(|g| g.size), Some(1448));
        assert_ne!(got[0].flags & NETRXF_CSUM_BLANK, 0);
        assert_ne!(got[0].flags & NETRXF_DATA_VALIDATED, 0);
        assert_eq!(h.hv.counters().multicalls, 1);
        assert_eq!(h.hv.counters().copies, 3);
    }

    #[test]
    fn test_flip_transfers_pages() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 3, true);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(32);

        let data = payload(100, 9);
        assert_eq!(
            h.partition.start_xmit(&netif, Packet::from_bytes(&data)),
            XmitOutcome::Queued
        );
        h.partition.run_until_idle().unwrap();

        let got = fe.receive();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, data);
        let counters = h.hv.counters();
        assert_eq!(counters.transfers, 1);
        assert_eq!(counters.va_updates, 1);
        assert_eq!(counters.mmu_updates, 1);
        assert_eq!(counters.reservations, 1);
    }

    #[test]
    fn test_flip_eagain_is_unrecoverable() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 3, true);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(32);
        h.hv.fail_next_transfers(GrantStatus::Eagain, 1);

        let _ = h.partition.start_xmit(&netif, Packet::from_bytes(&payload(100, 0)));
        let err = h.partition.run_until_idle().unwrap_err();
        assert!(matches!(err, Error::UnrecoverableTransfer { .. }));
    }

    #[test]
    fn test_copy_eagain_requeues() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 2, false);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(64);
        h.hv.fail_next_copies(GrantStatus::Eagain, 1);

        let data = payload(60, 1);
        let _ = h.partition.start_xmit(&netif, Packet::from_bytes(&data));
        h.partition.run_until_idle().unwrap();

        let got = fe.receive();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].error, Some(NetifStatus::Error.code()));
        assert_eq!(got[1].data, data);
        assert_eq!(got[1].error, None);
    }

    #[test]
    fn test_memory_squeeze_retries_after_timer() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 3, true);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(32);
        h.hv.set_frames_available(0);

        let _ = h.partition.start_xmit(&netif, Packet::from_bytes(&payload(100, 0)));
        h.partition.run_until_idle().unwrap();
        assert!(fe.receive().is_empty());
        assert!(!h.partition.has_work());
        assert_eq!(h.partition.next_timeout(), Some(RX_RETRY_DELAY));

        h.hv.set_frames_available(64);
        h.clock.advance(RX_RETRY_DELAY);
        h.partition.run_until_idle().unwrap();
        assert_eq!(fe.receive().len(), 1);
    }

    #[test]
    fn test_stopped_queue_backlogs_then_flushes() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 2, false);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(MAX_SKB_FRAGS + 2);

        let first = payload(60, 1);
        let second = payload(60, 2);
        assert_eq!(
            h.partition.start_xmit(&netif, Packet::from_bytes(&first)),
            XmitOutcome::Queued
        );
        assert!(netif.queue_stopped());
        assert_eq!(
            h.partition.start_xmit(&netif, Packet::from_bytes(&second)),
            XmitOutcome::Backlogged
        );

        h.partition.run_until_idle().unwrap();
        assert_eq!(fe.receive().len(), 1);

        fe.post_rx_buffers(40);
        h.partition.interrupt(&netif);
        assert!(!netif.queue_stopped());
        h.partition.run_until_idle().unwrap();
        let got = fe.receive();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, second);
    }

    #[test]
    fn test_drops_when_down_or_full() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 2, false);
        let netif = attach(&h, &fe);

        // No buffers posted.
        assert_eq!(
            h.partition.start_xmit(&netif, Packet::from_bytes(&[0u8; 60])),
            XmitOutcome::Dropped
        );
        fe.post_rx_buffers(64);
        netif.set_carrier(false);
        assert_eq!(
            h.partition.start_xmit(&netif, Packet::from_bytes(&[0u8; 60])),
            XmitOutcome::Dropped
        );
        assert_eq!(netif.stats().snapshot().rx_dropped, 2);
    }

    #[test]
    fn test_oversized_fragment_list() {
        let h = harness(CopyMode::None);
        let mut fe = frontend(&h.hv, 2, false);
        let netif = attach(&h, &fe);
        fe.post_rx_buffers(MAX_SKB_FRAGS + 2);

        // Small fragments are packed into fewer pages.
        let data = payload(100 * (MAX_SKB_FRAGS + 4), 1);
        let mut packet = Packet::from_bytes(&data[..100]);
        packet.frags = data[100..]
            .chunks(100)
            .map(|c| Fragment::local(Page::with_data(0, c), 0, c.len()))
            .collect();
        assert!(packet.nr_frags() > MAX_SKB_FRAGS);
        assert_eq!(h.partition.start_xmit(&netif, packet), XmitOutcome::Queued);
        h.partition.run_until_idle().unwrap();
        let got = fe.receive();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data, data);

        // Too many full pages to ever fit the ring.
        fe.post_rx_buffers(MAX_SKB_FRAGS + 2);
        let posted = fe.rx_posted();
        let big = vec![0u8; (MAX_SKB_FRAGS + 6) * PAGE_SIZE];
        assert_eq!(
            h.partition.start_xmit(&netif, Packet::from_bytes(&big)),
            XmitOutcome::Dropped
        );
        assert_eq!(netif.stats().snapshot().rx_dropped, 1);
        h.partition.run_until_idle().unwrap();
        assert!(fe.receive().is_empty());
        assert_eq!(fe.rx_posted(), posted);

        // The ring is still usable.
        assert_eq!(
            h.partition.start_xmit(&netif, Packet::from_bytes(&payload(60, 9))),
            XmitOutcome::Queued
        );
        h.partition.run_until_idle().unwrap();
        assert_eq!(fe.receive().len(), 1);
    }
}
