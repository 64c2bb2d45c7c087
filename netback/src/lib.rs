// SPDX-License-Identifier: Apache-2.0

//! Paravirtual network backend. Guests exchange packets with the host stack
//! through shared descriptor rings and page grants; the backend maps, copies
//! or transfers the granted pages in batched privileged calls.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

pub mod batch;
pub mod config;
pub mod credit;
mod dealloc;
pub mod emul;
pub mod frontend;
pub mod grant;
pub mod netif;
pub mod observer;
pub mod packet;
pub mod page;
pub mod partition;
mod pool;
pub mod protocol;
pub mod ring;
mod rx;
mod schedule;
pub mod time;
mod tx;
mod worker;

pub use config::{ConfigError, ExecutionMode, NetbackConfig};
pub use grant::{HypercallError, Hypervisor};
pub use netif::{ConnectRequest, CreditLimit, Interface, InterfaceId};
pub use observer::InterfaceObserver;
pub use packet::{Packet, PacketSink};
pub use partition::{CopyMode, Partition};
pub use rx::XmitOutcome;

use partition::Shared;
use page::PhysMap;
use time::{Clock, MonotonicClock};

/// How often a blocked disconnect rechecks the reference count.
const DISCONNECT_POLL: Duration = Duration::from_millis(10);

/// Backend errors.
#[derive(Debug)]
pub enum Error {
    /// Failed to create a partition wake event.
    WakeEvent(io::Error),
    /// Failed to start a partition worker thread.
    WorkerSpawn(io::Error),
    /// Invalid or unreadable configuration.
    Config(ConfigError),
    /// The interface identity is already connected.
    AlreadyConnected(InterfaceId),
    /// No connected interface has this identity.
    UnknownInterface(InterfaceId),
    /// A privileged call was rejected as a whole.
    Hypercall(HypercallError),
    /// A page transfer must be retried after other pages of the same packet
    /// were already handed over.
    UnrecoverableTransfer { interface: InterfaceId },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::WakeEvent(e) => write!(f, "wake event creation failed: {}", e),
            Error::WorkerSpawn(e) => write!(f, "worker spawn failed: {}", e),
            Error::Config(e) => write!(f, "configuration error: {}", e),
            Error::AlreadyConnected(id) => write!(f, "{} is already connected", id),
            Error::UnknownInterface(id) => write!(f, "{} is not connected", id),
            Error::Hypercall(e) => write!(f, "{}", e),
            Error::UnrecoverableTransfer { interface } => {
                write!(f, "{}: transfer needs retry after a partial page flip", interface)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<HypercallError> for Error {
    fn from(err: HypercallError) -> Self {
        Error::Hypercall(err)
    }
}

/// Dedicated [`Result`](https://doc.rust-lang.org/std/result/) type.
pub type Result<T> = std::result::Result<T, Error>;

/// Locks `m`, carrying on with the data if a holder panicked.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Netback {
    config: NetbackConfig,
    shared: Arc<Shared>,
    partitions: Vec<Arc<Partition>>,
    interfaces: Mutex<HashMap<InterfaceId, Arc<Interface>>>,
    observer: Mutex<Option<Arc<dyn InterfaceObserver>>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Netback {
    /// Create a backend. Worker threads are not started until [`start`].
    ///
    /// [`start`]: Netback::start
    pub fn new(
        config: NetbackConfig,
        hv: Arc<dyn Hypervisor>,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Self> {
        Self::with_clock(config, hv, sink, Arc::new(MonotonicClock))
    }

    pub fn with_clock(
        config: NetbackConfig,
        hv: Arc<dyn Hypervisor>,
        sink: Arc<dyn PacketSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let copy_mode = match (config.copy_skb, hv.supports_unmap_and_replace()) {
            (false, _) => CopyMode::None,
            (true, true) => CopyMode::Delayed,
            (true, false) => CopyMode::Always,
        };
        let shared = Arc::new(Shared {
            hv,
            sink,
            clock,
            p2m: PhysMap::default(),
            copy_mode,
            permute_returns: config.permute_returns,
        });

        let count = config.partition_count();
        let partitions = (0..count)
            .map(|index| Partition::new(index, shared.clone()).map_err(Error::WakeEvent))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "netback: {} partition(s), {:?} mode, copy mode {:?}",
            count, config.mode, copy_mode
        );

        Ok(Netback {
            config,
            shared,
            partitions,
            interfaces: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &NetbackConfig {
        &self.config
    }

    pub fn copy_mode(&self) -> CopyMode {
        self.shared.copy_mode
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    pub fn set_observer(&self, observer: Arc<dyn InterfaceObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn InterfaceObserver>> {
        lock(&self.observer).clone()
    }

    /// Spawns one worker per partition. Does nothing in inline mode or when
    /// already started.
    pub fn start(&self) -> Result<()> {
        if self.config.mode == ExecutionMode::Inline {
            return Ok(());
        }
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        for partition in &self.partitions {
            let handle = worker::spawn(partition.clone(), self.running.clone())
                .map_err(Error::WorkerSpawn)?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Stops and joins the worker threads.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for partition in &self.partitions {
            partition.waker.wake();
        }
        for handle in lock(&self.workers).drain(..) {
            let _ = handle.join();
        }
    }

    /// Runs every partition until idle. This is how work gets done in inline
    /// mode; returns the number of passes run.
    pub fn poll(&self) -> Result<usize> {
        let mut passes = 0;
        for partition in &self.partitions {
            passes += partition.run_until_idle()?;
        }
        Ok(passes)
    }

    pub fn interface(&self, id: InterfaceId) -> Option<Arc<Interface>> {
        lock(&self.interfaces).get(&id).cloned()
    }

    fn lookup(&self, id: InterfaceId) -> Result<Arc<Interface>> {
        self.interface(id).ok_or(Error::UnknownInterface(id))
    }

    /// Attaches a guest. The interface comes up with carrier on and is
    /// assigned to the least loaded partition.
    pub fn connect(&self, req: ConnectRequest) -> Result<Arc<Interface>> {
        let netif = {
            let mut interfaces = lock(&self.interfaces);
            if interfaces.contains_key(&req.id) {
                return Err(Error::AlreadyConnected(req.id));
            }
            let netif = Interface::new(&req, self.config.queue_length, self.shared.clock.now());
            interfaces.insert(req.id, netif.clone());
            netif
        };
        info!(
            "{}: connected, evtchn {}, {} receiver",
            req.id,
            req.evtchn,
            if req.copying_receiver { "copying" } else { "flipping" }
        );
        netif.set_carrier(true);
        netif.set_up(true);
        self.link_up(&netif);
        Ok(netif)
    }

    /// Administrative link state, as set by the host stack.
    pub fn set_link(&self, id: InterfaceId, up: bool) -> Result<()> {
        let netif = self.lookup(id)?;
        netif.set_up(up);
        if up {
            self.link_up(&netif);
        } else {
            self.link_down(&netif);
        }
        Ok(())
    }

    fn link_up(&self, netif: &Arc<Interface>) {
        if !netif.is_schedulable() || netif.partition().is_some() {
            return;
        }
        let Some(partition) = self.partitions.iter().min_by_key(|p| p.domains()) else {
            return;
        };
        partition.join();
        netif.set_partition(Some(partition.index()));
        info!("{}: up on partition {}", netif.id(), partition.index());
        if let Some(observer) = self.observer() {
            observer.interface_up(netif.id(), partition.index());
        }
        partition.schedule_work(netif);
    }

    fn link_down(&self, netif: &Arc<Interface>) {
        let Some(index) = netif.partition() else {
            return;
        };
        let partition = &self.partitions[index];
        partition.deschedule_work(netif);
        partition.cancel_timers(netif);
        netif.set_partition(None);
        partition.leave();
        info!("{}: down", netif.id());
        if let Some(observer) = self.observer() {
            observer.interface_down(netif.id());
        }
    }

    /// Detaches a guest and blocks until nothing refers to its interface.
    pub fn disconnect(&self, id: InterfaceId) -> Result<()> {
        let netif = lock(&self.interfaces)
            .remove(&id)
            .ok_or(Error::UnknownInterface(id))?;
        let partition = netif.partition().map(|index| self.partitions[index].clone());

        netif.set_carrier(false);
        self.link_down(&netif);
        let backlog = std::mem::take(&mut *lock(&netif.backlog));
        drop(backlog);
        if let Some(partition) = &partition {
            partition.purge_rx_queue(&netif);
        }
        netif.put();

        let mut waited = Duration::ZERO;
        loop {
            if self.config.mode == ExecutionMode::Inline {
                self.poll()?;
            }
            if netif.wait_released(DISCONNECT_POLL) {
                break;
            }
            // Timers and requeued packets from a pass that raced with link
            // down.
            if let Some(partition) = &partition {
                partition.cancel_timers(&netif);
                partition.purge_rx_queue(&netif);
            }
            waited += DISCONNECT_POLL;
            if waited == Duration::from_secs(1) {
                warn!(
                    "{}: disconnect waiting on {} reference(s)",
                    id,
                    netif.ref_count()
                );
            }
        }

        info!("{}: disconnected", id);
        if let Some(observer) = self.observer() {
            observer.interface_teardown(id);
        }
        Ok(())
    }

    /// Guest event channel notification.
    pub fn interrupt(&self, id: InterfaceId) -> Result<()> {
        let netif = self.lookup(id)?;
        if let Some(index) = netif.partition() {
            self.partitions[index].interrupt(&netif);
        }
        Ok(())
    }

    /// Queues a packet from the host stack for delivery to a guest.
    pub fn start_xmit(&self, id: InterfaceId, packet: Packet) -> Result<XmitOutcome> {
        let netif = self.lookup(id)?;
        match netif.partition() {
            Some(index) => Ok(self.partitions[index].start_xmit(&netif, packet)),
            None => {
                netif::InterfaceStats::add(&netif.stats().rx_dropped, 1);
                Ok(XmitOutcome::Dropped)
            }
        }
    }
}

impl Drop for Netback {
    fn drop(&mut self) {
        self.stop();
        let leftover = lock(&self.interfaces).len();
        if leftover > 0 {
            error!("netback dropped with {} interface(s) still connected", leftover);
        }
    }
}
