// SPDX-License-Identifier: Apache-2.0

//! A partition is one independent instance of the engine: its own pending
//! pool, dealloc ring, schedule list, receive queue and timers. Interfaces
//! are spread across partitions and each partition is driven by one worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::dealloc::DeallocRing;
use crate::grant::Hypervisor;
use crate::netif::{Interface, NetifRef};
use crate::packet::{Packet, PacketSink};
use crate::page::{PhysMap, ReleaseHook};
use crate::pool::PendingPool;
use crate::protocol::{MAX_PENDING_REQS, MAX_SKB_FRAGS};
use crate::rx::RxState;
use crate::schedule::ScheduleList;
use crate::time::{Clock, Timer, TimerQueue};
use crate::tx::TxState;
use crate::worker::Waker;
use crate::{Result, lock};

/// Passes run back to back before the worker checks for shutdown.
const MAX_PASSES_PER_RUN: usize = 64;

/// What happens to transmit pages still held by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Pages stay lent until the stack lets go.
    None,
    /// Packets are copied into local memory before delivery.
    Always,
    /// Pages held longer than the copy delay are copied out in place.
    Delayed,
}

/// State shared by every partition of one backend.
pub(crate) struct Shared {
    pub(crate) hv: Arc<dyn Hypervisor>,
    pub(crate) sink: Arc<dyn PacketSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) p2m: PhysMap,
    pub(crate) copy_mode: CopyMode,
    pub(crate) permute_returns: bool,
}

/// A packet waiting to be delivered to a guest.
pub(crate) struct QueuedPacket {
    pub(crate) netif: NetifRef,
    pub(crate) packet: Packet,
}

pub struct Partition {
    index: usize,
    pub(crate) shared: Arc<Shared>,
    pub(crate) schedule: ScheduleList,
    pub(crate) dealloc: Arc<DeallocRing>,
    pub(crate) waker: Arc<Waker>,
    pub(crate) release_hook: ReleaseHook,
    pub(crate) pool: Mutex<PendingPool>,
    pub(crate) rx_queue: Mutex<VecDeque<QueuedPacket>>,
    pub(crate) timers: Mutex<TimerQueue>,
    pub(crate) tx_pending_due: AtomicBool,
    pub(crate) tx_state: Mutex<TxState>,
    pub(crate) rx_state: Mutex<RxState>,
    domains: AtomicUsize,
}

impl Partition {
    pub(crate) fn new(index: usize, shared: Arc<Shared>) -> std::io::Result<Arc<Self>> {
        let dealloc = Arc::new(DeallocRing::new(MAX_PENDING_REQS));
        let waker = Arc::new(Waker::new()?);
        let release_hook: ReleaseHook = {
            let dealloc = dealloc.clone();
            let waker = waker.clone();
            Arc::new(move |slot| {
                dealloc.push(slot);
                waker.wake();
            })
        };
        Ok(Arc::new(Partition {
            index,
            shared,
            schedule: ScheduleList::default(),
            dealloc,
            waker,
            release_hook,
            pool: Mutex::new(PendingPool::new(MAX_PENDING_REQS)),
            rx_queue: Mutex::new(VecDeque::new()),
            timers: Mutex::new(TimerQueue::default()),
            tx_pending_due: AtomicBool::new(false),
            tx_state: Mutex::new(TxState::default()),
            rx_state: Mutex::new(RxState::default()),
            domains: AtomicUsize::new(0),
        }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Interfaces currently assigned here.
    pub fn domains(&self) -> usize {
        self.domains.load(Ordering::Acquire)
    }

    pub(crate) fn join(&self) {
        self.domains.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave(&self) {
        self.domains.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn pending_slots(&self) -> usize {
        lock(&self.pool).in_flight()
    }

    pub fn scheduled(&self) -> usize {
        self.schedule.len()
    }

    pub fn credit_timers(&self, netif: &Interface) -> usize {
        lock(&self.timers).count_credit_timers(netif)
    }

    pub(crate) fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    pub(crate) fn arm_timer(&self, deadline: Instant, timer: Timer) {
        let replaced = lock(&self.timers).arm(deadline, timer);
        drop(replaced);
        self.waker.wake();
    }

    pub(crate) fn cancel_timers(&self, netif: &Interface) {
        let cancelled = lock(&self.timers).cancel_for(netif);
        if !cancelled.is_empty() {
            lock(&netif.credit).cancel_timer();
        }
    }

    fn rx_work_todo(&self) -> bool {
        !lock(&self.rx_queue).is_empty() && !lock(&self.timers).rx_retry_pending()
    }

    fn tx_work_todo(&self) -> bool {
        if self.dealloc.has_pending() || self.tx_pending_due.load(Ordering::Acquire) {
            return true;
        }
        lock(&self.pool).in_flight() + MAX_SKB_FRAGS < MAX_PENDING_REQS
            && !self.schedule.is_empty()
    }

    pub fn has_work(&self) -> bool {
        self.rx_work_todo() || self.tx_work_todo()
    }

    /// Wakes the worker for transmit work if the pool has room to spare.
    pub(crate) fn maybe_schedule_tx_action(&self) {
        if lock(&self.pool).in_flight() < MAX_PENDING_REQS / 2 && !self.schedule.is_empty() {
            self.waker.wake();
        }
    }

    /// Queues `netif` if its ring holds unconsumed requests.
    pub(crate) fn schedule_work(&self, netif: &Arc<Interface>) {
        let more = lock(&netif.tx).final_check_for_requests();
        if more > 0 {
            self.schedule.add_tail(netif);
            self.maybe_schedule_tx_action();
        }
    }

    pub(crate) fn deschedule_work(&self, netif: &Interface) {
        self.schedule.remove(netif);
    }

    /// Guest notification.
    pub(crate) fn interrupt(&self, netif: &Arc<Interface>) {
        self.schedule.add_tail(netif);
        self.maybe_schedule_tx_action();
        if netif.is_schedulable() && !netif.rx_queue_full() {
            self.wake_queue(netif);
        }
    }

    fn fire_timers(&self) {
        let now = self.now();
        let expired = lock(&self.timers).take_expired(now);
        for timer in expired {
            match timer {
                Timer::Credit(netif) => {
                    let next = netif.next_tx_request_size();
                    lock(&netif.credit).timer_fired(next);
                    debug!("{}: credit window reopened", netif.id());
                    self.schedule_work(netif.arc());
                }
                Timer::QueueTimeout(netif) => {
                    if netif.is_schedulable() {
                        self.wake_queue(netif.arc());
                    }
                }
                Timer::RxRetry => self.waker.wake(),
                Timer::TxPending => {
                    self.tx_pending_due.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Runs receive and transmit passes until there is nothing left to do.
    pub fn run_until_idle(&self) -> Result<usize> {
        let mut passes = 0;
        while passes < MAX_PASSES_PER_RUN {
            self.fire_timers();
            let rx = self.rx_work_todo();
            let tx = self.tx_work_todo();
            if !rx && !tx {
                break;
            }
            if rx {
                self.net_rx_action()?;
            }
            if tx {
                self.net_tx_action()?;
            }
            passes += 1;
        }
        Ok(passes)
    }

    /// Time until the earliest timer, if any is armed.
    pub fn next_timeout(&self) -> Option<Duration> {
        lock(&self.timers)
            .next_deadline()
            .map(|at| at.saturating_duration_since(self.now()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::emul::EmulatedHypervisor;
    use crate::netif::InterfaceId;
    use crate::netif::tests::connect_request;
    use crate::time::ManualClock;

    pub(crate) struct Harness {
        pub(crate) hv: Arc<EmulatedHypervisor>,
        pub(crate) clock: Arc<ManualClock>,
        pub(crate) delivered: Arc<Mutex<Vec<(InterfaceId, Packet)>>>,
        pub(crate) partition: Arc<Partition>,
    }

    pub(crate) fn harness(copy_mode: CopyMode) -> Harness {
        harness_with(copy_mode, false)
    }

    pub(crate) fn harness_with(copy_mode: CopyMode, permute_returns: bool) -> Harness {
        let hv = Arc::new(EmulatedHypervisor::new());
        let clock = Arc::new(ManualClock::default());
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let delivered = delivered.clone();
            move |from: InterfaceId, packet: Packet| delivered.lock().unwrap().push((from, packet))
        };
        let shared = Arc::new(Shared {
            hv: hv.clone(),
            sink: Arc::new(sink),
            clock: clock.clone(),
            p2m: PhysMap::default(),
            copy_mode,
            permute_returns,
        });
        let partition = Partition::new(0, shared).unwrap();
        Harness {
            hv,
            clock,
            delivered,
            partition,
        }
    }

    #[test]
    fn test_idle_partition_has_no_work() {
        let h = harness(CopyMode::None);
        assert!(!h.partition.has_work());
        assert_eq!(h.partition.run_until_idle().unwrap(), 0);
        assert_eq!(h.partition.next_timeout(), None);
    }

    #[test]
    fn test_release_hook_stages_and_wakes() {
        let h = harness(CopyMode::None);
        (h.partition.release_hook)(5);
        assert!(h.partition.dealloc.has_pending());
        assert!(h.partition.waker.clear());
    }

    #[test]
    fn test_cancel_timers_drops_references() {
        let h = harness(CopyMode::None);
        let netif = Interface::new(&connect_request(1), 32, h.clock.now());
        h.partition
            .arm_timer(h.clock.now() + Duration::from_secs(1), Timer::Credit(netif.get()));
        assert_eq!(netif.ref_count(), 2);
        assert_eq!(h.partition.credit_timers(&netif), 1);
        h.partition.cancel_timers(&netif);
        assert_eq!(netif.ref_count(), 1);
        assert_eq!(h.partition.next_timeout(), None);
    }
}
