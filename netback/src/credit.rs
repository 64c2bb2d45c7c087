// SPDX-License-Identifier: Apache-2.0

//! Per-interface transmit credit.
//!
//! The guest may send `credit_bytes` every `credit_usec`. A request larger
//! than the remaining credit waits for the window to roll over; a single
//! one-shot timer covers the wait.

use std::time::{Duration, Instant};

/// Cap on the burst a single large request may pull into the bucket.
pub const MAX_CREDIT_BURST: u64 = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditCheck {
    Accepted,
    /// Not enough credit; a timer must be armed for `until`.
    Deferred { until: Instant },
    /// Not enough credit and a timer is already pending.
    TimerPending,
}

#[derive(Debug, Clone)]
pub struct CreditBucket {
    remaining: u64,
    credit_bytes: u64,
    credit_usec: u64,
    window_start: Instant,
    timer: Option<Instant>,
}

impl CreditBucket {
    pub fn unlimited(now: Instant) -> Self {
        Self::new(u64::MAX, 0, now)
    }

    pub fn new(credit_bytes: u64, credit_usec: u64, now: Instant) -> Self {
        CreditBucket {
            remaining: credit_bytes,
            credit_bytes,
            credit_usec,
            window_start: now,
            timer: None,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn timer_pending(&self) -> bool {
        self.timer.is_some()
    }

    fn next_refill(&self) -> Instant {
        self.window_start + Duration::from_micros(self.credit_usec)
    }

    fn add_credit(&mut self, next_req_size: u64) {
        // A large request must be able to go through eventually even when it
        // exceeds the per-window allowance.
        let max_burst = next_req_size.min(MAX_CREDIT_BURST).max(self.credit_bytes);
        let max_credit = self.remaining.saturating_add(self.credit_bytes);
        self.remaining = max_credit.min(max_burst);
    }

    pub fn check(&mut self, size: u64, now: Instant) -> CreditCheck {
        if size > self.remaining {
            if self.timer.is_some() {
                return CreditCheck::TimerPending;
            }
            let next = self.next_refill();
            if now >= next {
                self.window_start = now;
                self.add_credit(size);
            }
            if size > self.remaining {
                self.window_start = next;
                self.timer = Some(next);
                return CreditCheck::Deferred { until: next };
            }
        }
        self.remaining -= size;
        CreditCheck::Accepted
    }

    /// Timer expiry: refill for the request now at the head of the ring.
    pub fn timer_fired(&mut self, next_req_size: u64) {
        self.timer = None;
        self.add_credit(next_req_size);
    }

    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }
}
