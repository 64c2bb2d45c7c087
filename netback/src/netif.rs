// SPDX-License-Identifier: Apache-2.0

//! Guest-facing virtual interfaces.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::credit::CreditBucket;
use crate::grant::{DomId, EventChannel};
use crate::lock;
use crate::packet::Packet;
use crate::protocol::{MAX_SKB_FRAGS, NET_RX_RING_SIZE};
use crate::ring::{RxBackRing, RxSharedRing, TxBackRing, TxSharedRing};

const UNASSIGNED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId {
    pub domid: DomId,
    pub handle: u32,
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vif{}.{}", self.domid, self.handle)
    }
}

/// Transmit rate limit: `bytes` every `usec` microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditLimit {
    pub bytes: u64,
    pub usec: u64,
}

/// Everything the guest negotiated when connecting.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub id: InterfaceId,
    pub tx_ring: Arc<TxSharedRing>,
    pub rx_ring: Arc<RxSharedRing>,
    pub evtchn: EventChannel,
    /// Guest wants received data copied into its buffers rather than
    /// receiving page ownership.
    pub copying_receiver: bool,
    /// Guest sets `req_event` on the receive ring so the backend may stop
    /// and wait instead of dropping.
    pub can_queue: bool,
    pub scatter_gather: bool,
    pub tso: bool,
    pub credit: Option<CreditLimit>,
}

#[derive(Debug, Default)]
pub struct InterfaceStats {
    /// Packets and bytes the guest transmitted.
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
    /// Packets and bytes delivered to the guest.
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    /// Lent transmit pages copied out after holding their slot too long.
    pub copied_pages: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub copied_pages: u64,
}

impl InterfaceStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            copied_pages: self.copied_pages.load(Ordering::Relaxed),
        }
    }
}

pub struct Interface {
    id: InterfaceId,
    evtchn: EventChannel,
    copying_receiver: bool,
    can_queue: bool,
    scatter_gather: bool,
    tso: bool,
    pub(crate) tx: Mutex<TxBackRing>,
    pub(crate) rx: Mutex<RxBackRing>,
    /// Receive requests reserved by queued packets, ahead of `rx.req_cons`.
    pub(crate) rx_req_cons_peek: AtomicU32,
    pub(crate) credit: Mutex<CreditBucket>,
    carrier: AtomicBool,
    up: AtomicBool,
    group: AtomicUsize,
    /// Guarded by the schedule list lock for writes.
    pub(crate) on_schedule_list: AtomicBool,
    queue_stopped: AtomicBool,
    pub(crate) backlog: Mutex<VecDeque<Packet>>,
    queue_length: usize,
    refcnt: AtomicUsize,
    free_lock: Mutex<()>,
    freed: Condvar,
    stats: InterfaceStats,
}

impl Interface {
    /// Starts with one reference, owned by the connection.
    pub(crate) fn new(req: &ConnectRequest, queue_length: usize, now: Instant) -> Arc<Self> {
        let credit = match req.credit {
            Some(limit) => CreditBucket::new(limit.bytes, limit.usec, now),
            None => CreditBucket::unlimited(now),
        };
        Arc::new(Interface {
            id: req.id,
            evtchn: req.evtchn,
            copying_receiver: req.copying_receiver,
            can_queue: req.can_queue,
            scatter_gather: req.scatter_gather,
            tso: req.tso,
            tx: Mutex::new(TxBackRing::new(req.tx_ring.clone())),
            rx: Mutex::new(RxBackRing::new(req.rx_ring.clone())),
            rx_req_cons_peek: AtomicU32::new(0),
            credit: Mutex::new(credit),
            carrier: AtomicBool::new(false),
            up: AtomicBool::new(false),
            group: AtomicUsize::new(UNASSIGNED),
            on_schedule_list: AtomicBool::new(false),
            queue_stopped: AtomicBool::new(false),
            backlog: Mutex::new(VecDeque::new()),
            queue_length,
            refcnt: AtomicUsize::new(1),
            free_lock: Mutex::new(()),
            freed: Condvar::new(),
            stats: InterfaceStats::default(),
        })
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn domid(&self) -> DomId {
        self.id.domid
    }

    pub fn evtchn(&self) -> EventChannel {
        self.evtchn
    }

    pub fn copying_receiver(&self) -> bool {
        self.copying_receiver
    }

    pub fn can_queue(&self) -> bool {
        self.can_queue
    }

    pub fn scatter_gather(&self) -> bool {
        self.scatter_gather
    }

    pub fn tso(&self) -> bool {
        self.tso
    }

    pub fn stats(&self) -> &InterfaceStats {
        &self.stats
    }

    pub fn ref_count(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn get(self: &Arc<Self>) -> NetifRef {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
        NetifRef(self.clone())
    }

    pub fn carrier(&self) -> bool {
        self.carrier.load(Ordering::Acquire)
    }

    pub(crate) fn set_carrier(&self, on: bool) {
        self.carrier.store(on, Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub(crate) fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    pub fn is_schedulable(&self) -> bool {
        self.carrier() && self.is_up()
    }

    pub fn partition(&self) -> Option<usize> {
        match self.group.load(Ordering::Acquire) {
            UNASSIGNED => None,
            group => Some(group),
        }
    }

    pub(crate) fn set_partition(&self, group: Option<usize>) {
        self.group
            .store(group.unwrap_or(UNASSIGNED), Ordering::Release);
    }

    pub fn queue_stopped(&self) -> bool {
        self.queue_stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop_queue(&self) {
        self.queue_stopped.store(true, Ordering::Release);
    }

    /// Returns true if the queue was stopped.
    pub(crate) fn start_queue(&self) -> bool {
        self.queue_stopped.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn backlog_push(&self, packet: Packet) -> bool {
        let mut backlog = lock(&self.backlog);
        if backlog.len() >= self.queue_length {
            return false;
        }
        backlog.push_back(packet);
        true
    }

    /// Worst-case receive ring slots one packet can consume.
    pub(crate) fn max_required_rx_slots(&self) -> u32 {
        if self.scatter_gather || self.tso {
            MAX_SKB_FRAGS as u32 + 2
        } else {
            1
        }
    }

    pub(crate) fn rx_queue_full(&self) -> bool {
        let rx = lock(&self.rx);
        self.rx_queue_full_locked(&rx)
    }

    pub(crate) fn rx_queue_full_locked(&self, rx: &RxBackRing) -> bool {
        let peek = self.rx_req_cons_peek.load(Ordering::Acquire);
        let needed = self.max_required_rx_slots();
        let posted = rx.shared().req_prod().wrapping_sub(peek);
        let room = rx
            .rsp_prod_pvt()
            .wrapping_add(NET_RX_RING_SIZE as u32)
            .wrapping_sub(peek);
        posted < needed || room < needed
    }

    /// Size of the next transmit request, or 0 if none is published.
    pub(crate) fn next_tx_request_size(&self) -> u64 {
        let tx = lock(&self.tx);
        if tx.unconsumed_requests() == 0 {
            return 0;
        }
        tx.request(tx.req_cons()).request().size as u64
    }

    /// Waits up to `timeout` for the reference count to reach zero.
    pub(crate) fn wait_released(&self, timeout: Duration) -> bool {
        let guard = lock(&self.free_lock);
        let (_guard, _) = self
            .freed
            .wait_timeout_while(guard, timeout, |_| self.refcnt.load(Ordering::Acquire) != 0)
            .unwrap_or_else(PoisonError::into_inner);
        self.refcnt.load(Ordering::Acquire) == 0
    }

    pub(crate) fn put(&self) {
        if self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard: MutexGuard<'_, ()> = lock(&self.free_lock);
            self.freed.notify_all();
        }
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id)
            .field("carrier", &self.carrier())
            .field("up", &self.is_up())
            .field("partition", &self.partition())
            .field("refcnt", &self.ref_count())
            .finish()
    }
}

/// Counted reference to an interface. Disconnect waits for every one of
/// these to drop.
pub struct NetifRef(Arc<Interface>);

impl NetifRef {
    pub fn arc(&self) -> &Arc<Interface> {
        &self.0
    }
}

impl Clone for NetifRef {
    fn clone(&self) -> Self {
        self.0.get()
    }
}

impl Drop for NetifRef {
    fn drop(&mut self) {
        self.0.put();
    }
}

impl Deref for NetifRef {
    type Target = Interface;

    fn deref(&self) -> &Interface {
        &self.0
    }
}

impl fmt::Debug for NetifRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetifRef({})", self.0.id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{NET_RX_RING_SIZE, NET_TX_RING_SIZE};
    use crate::ring::RxFrontRing;
    use crate::protocol::RxRequest;
    use std::thread;

    pub(crate) fn connect_request(domid: DomId) -> ConnectRequest {
        ConnectRequest {
            id: InterfaceId { domid, handle: 0 },
            tx_ring: TxSharedRing::new(NET_TX_RING_SIZE),
            rx_ring: RxSharedRing::new(NET_RX_RING_SIZE),
            evtchn: 10 + domid as u32,
            copying_receiver: true,
            can_queue: true,
            scatter_gather: true,
            tso: true,
            credit: None,
        }
    }

    #[test]
    fn test_display_id() {
        let id = InterfaceId { domid: 3, handle: 1 };
        assert_eq!(id.to_string(), "vif3.1");
    }

    #[test]
    fn test_refcount_release_wakes_waiter() {
        let netif = Interface::new(&connect_request(1), 32, Instant::now());
        let held = netif.get();
        assert_eq!(netif.ref_count(), 2);
        netif.put();
        assert!(!netif.wait_released(Duration::from_millis(1)));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
        });
        assert!(netif.wait_released(Duration::from_secs(5)));
        releaser.join().unwrap();
    }

    #[test]
    fn test_rx_queue_full_tracks_posted_buffers() {
        let req = connect_request(1);
        let netif = Interface::new(&req, 32, Instant::now());
        assert!(netif.rx_queue_full());

        let mut front = RxFrontRing::new(req.rx_ring.clone());
        for id in 0..MAX_SKB_FRAGS as u16 + 2 {
            front.push_request(RxRequest { id, gref: id as u32 }).unwrap();
        }
        front.push_requests_and_check_notify();
        assert!(!netif.rx_queue_full());

        netif.rx_req_cons_peek.fetch_add(1, Ordering::AcqRel);
        assert!(netif.rx_queue_full());
    }

    #[test]
    fn test_backlog_bounded() {
        let netif = Interface::new(&connect_request(1), 2, Instant::now());
        assert!(netif.backlog_push(Packet::from_bytes(&[0u8; 60])));
        assert!(netif.backlog_push(Packet::from_bytes(&[0u8; 60])));
        assert!(!netif.backlog_push(Packet::from_bytes(&[0u8; 60])));
    }
}
