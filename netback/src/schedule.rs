// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::netif::{Interface, NetifRef};

/// FIFO of interfaces with transmit work. Membership holds a reference.
#[derive(Default)]
pub struct ScheduleList {
    list: Mutex<VecDeque<NetifRef>>,
}

impl ScheduleList {
    /// Appends `netif` unless it is already queued or not schedulable.
    pub fn add_tail(&self, netif: &Arc<Interface>) -> bool {
        if netif.on_schedule_list.load(Ordering::Acquire) {
            return false;
        }
        let mut list = lock(&self.list);
        if netif.on_schedule_list.load(Ordering::Acquire) || !netif.is_schedulable() {
            return false;
        }
        netif.on_schedule_list.store(true, Ordering::Release);
        list.push_back(netif.get());
        true
    }

    pub fn remove(&self, netif: &Interface) -> bool {
        let removed = {
            let mut list = lock(&self.list);
            if !netif.on_schedule_list.load(Ordering::Acquire) {
                return false;
            }
            netif.on_schedule_list.store(false, Ordering::Release);
            list.iter()
                .position(|n| n.id() == netif.id())
                .and_then(|pos| list.remove(pos))
        };
        removed.is_some()
    }

    pub fn pop_front(&self) -> Option<NetifRef> {
        let mut list = lock(&self.list);
        let netif = list.pop_front()?;
        netif.on_schedule_list.store(false, Ordering::Release);
        Some(netif)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.list).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.list).len()
    }
}
