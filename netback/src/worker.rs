// SPDX-License-Identifier: Apache-2.0

//! Partition worker threads.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use event_manager::{
    EventManager, EventOps, EventSet, Events, MutEventSubscriber, SubscriberOps,
};
use log::{error, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::partition::Partition;

/// Upper bound on one event loop wait, so the stop flag is noticed.
const MAX_WAIT_MS: u64 = 100;

/// Wakes a partition worker. Safe to call from any thread.
pub struct Waker {
    fd: EventFd,
    kicked: AtomicBool,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        Ok(Waker {
            fd: EventFd::new(libc::EFD_NONBLOCK)?,
            kicked: AtomicBool::new(false),
        })
    }

    pub fn wake(&self) {
        self.kicked.store(true, Ordering::Release);
        if let Err(e) = self.fd.write(1) {
            warn!("Failed to signal partition worker: {:?}", e);
        }
    }

    /// Consumes pending wakeups. Returns whether there were any.
    pub fn clear(&self) -> bool {
        // Nonblocking: fails with WouldBlock when the counter is already zero.
        let _ = self.fd.read();
        self.kicked.swap(false, Ordering::AcqRel)
    }

    pub fn fd(&self) -> &EventFd {
        &self.fd
    }
}

struct WakeHandler {
    partition: Arc<Partition>,
}

impl MutEventSubscriber for WakeHandler {
    fn process(&mut self, events: Events, _ops: &mut EventOps) {
        if events.event_set() != EventSet::IN {
            return;
        }
        self.partition.waker.clear();
    }

    fn init(&mut self, ops: &mut EventOps) {
        if let Err(e) = ops.add(Events::new(self.partition.waker.fd(), EventSet::IN)) {
            error!(
                "netback/{}: unable to register wake event: {:?}",
                self.partition.index(),
                e
            );
        }
    }
}

pub(crate) fn spawn(
    partition: Arc<Partition>,
    running: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("netback/{}", partition.index()))
        .spawn(move || run(partition, running))
}

fn wait_ms(partition: &Partition) -> i32 {
    if partition.has_work() {
        return 0;
    }
    let cap = Duration::from_millis(MAX_WAIT_MS);
    let wait = partition.next_timeout().map_or(cap, |t| t.min(cap));
    // Round up so an armed timer is due when the wait ends.
    wait.as_micros().div_ceil(1000) as i32
}

fn run(partition: Arc<Partition>, running: Arc<AtomicBool>) {
    let mut event_manager: EventManager<Arc<Mutex<dyn MutEventSubscriber>>> =
        match EventManager::new() {
            Ok(manager) => manager,
            Err(e) => {
                error!("netback/{}: event manager creation failed: {:?}", partition.index(), e);
                return;
            }
        };
    let handler: Arc<Mutex<dyn MutEventSubscriber>> = Arc::new(Mutex::new(WakeHandler {
        partition: partition.clone(),
    }));
    event_manager.add_subscriber(handler);

    while running.load(Ordering::SeqCst) {
        if let Err(e) = partition.run_until_idle() {
            error!("netback/{}: {}", partition.index(), e);
            std::process::abort();
        }
        if let Err(e) = event_manager.run_with_timeout(wait_ms(&partition)) {
            error!("netback/{}: event loop failed: {:?}", partition.index(), e);
            break;
        }
    }
}
