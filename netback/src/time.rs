// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;
use crate::netif::{Interface, NetifRef};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *lock(&self.offset)
    }
}

pub(crate) enum Timer {
    /// Credit window elapsed for a throttled interface.
    Credit(NetifRef),
    /// A stopped receive queue waited too long for guest buffers.
    QueueTimeout(NetifRef),
    /// Frame reservation failed; retry the receive queue.
    RxRetry,
    /// Lent transmit pages are due for a copy-out check.
    TxPending,
}

impl Timer {
    fn netif(&self) -> Option<&Interface> {
        match self {
            Timer::Credit(netif) | Timer::QueueTimeout(netif) => Some(&**netif),
            Timer::RxRetry | Timer::TxPending => None,
        }
    }

    fn same_as(&self, other: &Timer) -> bool {
        match (self, other) {
            (Timer::Credit(a), Timer::Credit(b)) => a.id() == b.id(),
            (Timer::QueueTimeout(a), Timer::QueueTimeout(b)) => a.id() == b.id(),
            (Timer::RxRetry, Timer::RxRetry) | (Timer::TxPending, Timer::TxPending) => true,
            _ => false,
        }
    }
}

/// One-shot timers of a partition. Arming a timer that is already pending
/// moves its deadline.
#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: Vec<(Instant, Timer)>,
}

impl TimerQueue {
    /// Returns the timer it replaced, if any.
    pub(crate) fn arm(&mut self, deadline: Instant, timer: Timer) -> Option<Timer> {
        let old = self
            .entries
            .iter()
            .position(|(_, t)| t.same_as(&timer))
            .map(|pos| self.entries.swap_remove(pos).1);
        self.entries.push((deadline, timer));
        old
    }

    pub(crate) fn is_armed(&self, timer: &Timer) -> bool {
        self.entries.iter().any(|(_, t)| t.same_as(timer))
    }

    pub(crate) fn rx_retry_pending(&self) -> bool {
        self.is_armed(&Timer::RxRetry)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|(at, _)| *at).min()
    }

    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let mut expired: Vec<(Instant, Timer)> = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].0 <= now {
                expired.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(|(at, _)| *at);
        expired.into_iter().map(|(_, t)| t).collect()
    }

    /// Removes every timer holding `netif`.
    pub(crate) fn cancel_for(&mut self, netif: &Interface) -> Vec<Timer> {
        let mut cancelled = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].1.netif().map(|n| n.id()) == Some(netif.id()) {
                cancelled.push(self.entries.swap_remove(i).1);
            } else {
                i += 1;
            }
        }
        cancelled
    }

    pub(crate) fn count_credit_timers(&self, netif: &Interface) -> usize {
        self.entries
            .iter()
            .filter(|(_, t)| matches!(t, Timer::Credit(n) if n.id() == netif.id()))
            .count()
    }
}
