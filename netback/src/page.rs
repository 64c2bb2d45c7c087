// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::grant::{DomId, GrantRef};
use crate::lock;
use crate::protocol::PAGE_SIZE;

pub type Pfn = u64;
pub type Mfn = u64;

static NEXT_PFN: AtomicU64 = AtomicU64::new(0x1000);

/// A page of backend memory.
pub struct Page {
    pfn: Pfn,
    data: Mutex<Box<[u8]>>,
}

impl Page {
    pub fn new() -> Arc<Page> {
        Arc::new(Page {
            pfn: NEXT_PFN.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        })
    }

    pub fn with_data(offset: usize, bytes: &[u8]) -> Arc<Page> {
        let page = Page::new();
        page.write(offset, bytes);
        page
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Panics when the range leaves the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = lock(&self.data);
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Panics when the range leaves the page.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = lock(&self.data);
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out);
        out
    }

    pub fn copy_from(&self, other: &Page) {
        let src = lock(&other.data).clone();
        lock(&self.data).copy_from_slice(&src);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x})", self.pfn)
    }
}

/// Called with the pending slot index when the last holder of a mapped
/// foreign page lets go of it.
pub type ReleaseHook = Arc<dyn Fn(u16) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantOrigin {
    pub domid: DomId,
    pub gref: GrantRef,
}

pub(crate) struct Lease {
    page: Arc<Page>,
    slot: u16,
    origin: GrantOrigin,
    hook: ReleaseHook,
    detached: AtomicBool,
}

impl Lease {
    /// Stops the release hook from firing: the page is no longer backed by
    /// the grant.
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Acquire) {
            (self.hook)(self.slot);
        }
    }
}

/// A foreign page mapped into a pending slot and lent to a packet.
#[derive(Clone)]
pub struct ForeignPage {
    lease: Arc<Lease>,
}

impl ForeignPage {
    pub(crate) fn new(
        page: Arc<Page>,
        slot: u16,
        origin: GrantOrigin,
        hook: ReleaseHook,
    ) -> (Self, Weak<Lease>) {
        let lease = Arc::new(Lease {
            page,
            slot,
            origin,
            hook,
            detached: AtomicBool::new(false),
        });
        let tracker = Arc::downgrade(&lease);
        (ForeignPage { lease }, tracker)
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.lease.page
    }

    /// The grant still backing this page, if it has not been copied out.
    pub fn origin(&self) -> Option<GrantOrigin> {
        if self.lease.detached.load(Ordering::Acquire) {
            None
        } else {
            Some(self.lease.origin)
        }
    }
}

impl fmt::Debug for ForeignPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignPage")
            .field("slot", &self.lease.slot)
            .field("origin", &self.origin())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum FragPage {
    Local(Arc<Page>),
    Foreign(ForeignPage),
}

impl FragPage {
    pub fn page(&self) -> &Arc<Page> {
        match self {
            FragPage::Local(page) => page,
            FragPage::Foreign(foreign) => foreign.page(),
        }
    }

    pub fn grant_origin(&self) -> Option<GrantOrigin> {
        match self {
            FragPage::Local(_) => None,
            FragPage::Foreign(foreign) => foreign.origin(),
        }
    }
}

/// Physical-to-machine frame map for backend pages. Identity unless a page
/// was flipped to a guest and backed by a fresh frame.
#[derive(Debug, Default)]
pub struct PhysMap {
    overrides: Mutex<HashMap<Pfn, Mfn>>,
}

impl PhysMap {
    pub fn mfn(&self, pfn: Pfn) -> Mfn {
        lock(&self.overrides).get(&pfn).copied().unwrap_or(pfn)
    }

    pub fn set(&self, pfn: Pfn, mfn: Mfn) {
        lock(&self.overrides).insert(pfn, mfn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_hook() -> (ReleaseHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            Arc::new(move |_slot| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[test]
    fn test_page_read_write() {
        let page = Page::with_data(10, b"hello");
        assert_eq!(page.to_vec(10, 5), b"hello");
        assert_eq!(page.to_vec(0, 2), [0, 0]);
    }

    #[test]
    fn test_hook_fires_on_last_clone() {
        let (hook, count) = counting_hook();
        let origin = GrantOrigin { domid: 1, gref: 9 };
        let (foreign, tracker) = ForeignPage::new(Page::new(), 4, origin, hook);
        let clone = foreign.clone();
        drop(foreign);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(clone.origin(), Some(origin));
        drop(clone);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(tracker.upgrade().is_none());
    }

    #[test]
    fn test_detached_lease_is_silent() {
        let (hook, count) = counting_hook();
        let origin = GrantOrigin { domid: 1, gref: 9 };
        let (foreign, tracker) = ForeignPage::new(Page::new(), 4, origin, hook);
        tracker.upgrade().unwrap().detach();
        assert_eq!(foreign.origin(), None);
        drop(foreign);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_phys_map_defaults_to_identity() {
        let map = PhysMap::default();
        assert_eq!(map.mfn(42), 42);
        map.set(42, 7);
        assert_eq!(map.mfn(42), 7);
    }
}
