// SPDX-License-Identifier: Apache-2.0

//! Software hypervisor: a grant table, frame reservation and event channel
//! counters, with fault injection for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::grant::{
    CopyOp, CopySource, DomId, EventChannel, GrantHandle, GrantRef, GrantStatus, HypercallError,
    Hypervisor, MapOp, MultiCall, MultiCallOp, PageCopy, TransferOp, UnmapOp,
};
use crate::lock;
use crate::page::{Mfn, Page};
use crate::protocol::PAGE_SIZE;

enum GrantKind {
    Access { page: Arc<Page>, readonly: bool },
    Transfer { received: Option<Arc<Page>> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub map_calls: usize,
    pub unmap_calls: usize,
    pub multicalls: usize,
    /// Direct notifications, outside of multicalls.
    pub notify_calls: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub copies: usize,
    pub transfers: usize,
    pub va_updates: usize,
    pub mmu_updates: usize,
    pub reservations: usize,
}

struct State {
    grants: HashMap<(DomId, GrantRef), GrantKind>,
    next_gref: HashMap<DomId, GrantRef>,
    mapped: HashMap<GrantHandle, (DomId, GrantRef)>,
    next_handle: GrantHandle,
    next_mfn: Mfn,
    frames_available: usize,
    notifications: HashMap<EventChannel, usize>,
    counters: Counters,
    map_faults: HashMap<(DomId, GrantRef), GrantStatus>,
    copy_faults: VecDeque<GrantStatus>,
    transfer_faults: VecDeque<GrantStatus>,
    unmap_and_replace: bool,
    page_copy: PageCopy,
}

pub struct EmulatedHypervisor {
    state: Mutex<State>,
}

impl Default for EmulatedHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedHypervisor {
    pub fn new() -> Self {
        EmulatedHypervisor {
            state: Mutex::new(State {
                grants: HashMap::new(),
                next_gref: HashMap::new(),
                mapped: HashMap::new(),
                next_handle: 1,
                next_mfn: 0x8000_0000,
                frames_available: usize::MAX,
                notifications: HashMap::new(),
                counters: Counters::default(),
                map_faults: HashMap::new(),
                copy_faults: VecDeque::new(),
                transfer_faults: VecDeque::new(),
                unmap_and_replace: false,
                page_copy: PageCopy::Copied,
            }),
        }
    }

    fn new_gref(state: &mut State, domid: DomId) -> GrantRef {
        let next = state.next_gref.entry(domid).or_insert(8);
        let gref = *next;
        *next += 1;
        gref
    }

    /// Domain `domid` grants the backend access to `page`.
    pub fn grant_access(&self, domid: DomId, page: Arc<Page>, readonly: bool) -> GrantRef {
        let mut state = lock(&self.state);
        let gref = Self::new_gref(&mut state, domid);
        state
            .grants
            .insert((domid, gref), GrantKind::Access { page, readonly });
        gref
    }

    /// Domain `domid` offers to accept a page.
    pub fn grant_transfer(&self, domid: DomId) -> GrantRef {
        let mut state = lock(&self.state);
        let gref = Self::new_gref(&mut state, domid);
        state
            .grants
            .insert((domid, gref), GrantKind::Transfer { received: None });
        gref
    }

    pub fn transferred_page(&self, domid: DomId, gref: GrantRef) -> Option<Arc<Page>> {
        match lock(&self.state).grants.get(&(domid, gref)) {
            Some(GrantKind::Transfer { received }) => received.clone(),
            _ => None,
        }
    }

    /// Revokes a grant. Returns false if it is still mapped.
    pub fn end_access(&self, domid: DomId, gref: GrantRef) -> bool {
        let mut state = lock(&self.state);
        if state.mapped.values().any(|&key| key == (domid, gref)) {
            return false;
        }
        state.grants.remove(&(domid, gref));
        true
    }

    pub fn mapped_count(&self) -> usize {
        lock(&self.state).mapped.len()
    }

    pub fn notifications(&self, port: EventChannel) -> usize {
        lock(&self.state).notifications.get(&port).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> Counters {
        lock(&self.state).counters
    }

    /// Every map of this grant fails with `status`.
    pub fn fail_map(&self, domid: DomId, gref: GrantRef, status: GrantStatus) {
        lock(&self.state).map_faults.insert((domid, gref), status);
    }

    /// The next `n` copy operations fail with `status`.
    pub fn fail_next_copies(&self, status: GrantStatus, n: usize) {
        lock(&self.state).copy_faults.extend(std::iter::repeat_n(status, n));
    }

    pub fn fail_next_transfers(&self, status: GrantStatus, n: usize) {
        lock(&self.state)
            .transfer_faults
            .extend(std::iter::repeat_n(status, n));
    }

    pub fn set_frames_available(&self, frames: usize) {
        lock(&self.state).frames_available = frames;
    }

    pub fn set_unmap_and_replace(&self, supported: bool, outcome: PageCopy) {
        let mut state = lock(&self.state);
        state.unmap_and_replace = supported;
        state.page_copy = outcome;
    }

    fn do_copy(state: &mut State, op: &mut CopyOp) -> GrantStatus {
        if let Some(status) = state.copy_faults.pop_front() {
            return status;
        }
        if op.source_offset + op.len > PAGE_SIZE || op.dest_offset + op.len > PAGE_SIZE {
            return GrantStatus::BadCopyArg;
        }
        let data = match &op.source {
            CopySource::Grant { domid, gref } => match state.grants.get(&(*domid, *gref)) {
                Some(GrantKind::Access { page, .. }) => page.to_vec(op.source_offset, op.len),
                _ => return GrantStatus::BadGntref,
            },
            CopySource::Local { page, .. } => page.to_vec(op.source_offset, op.len),
        };
        match state.grants.get(&(op.dest_domid, op.dest_gref)) {
            Some(GrantKind::Access {
                page,
                readonly: false,
            }) => {
                page.write(op.dest_offset, &data);
                state.counters.copies += 1;
                GrantStatus::Okay
            }
            Some(GrantKind::Access { readonly: true, .. }) => GrantStatus::PermissionDenied,
            _ => GrantStatus::BadGntref,
        }
    }

    fn do_transfer(state: &mut State, op: &mut TransferOp) -> GrantStatus {
        if let Some(status) = state.transfer_faults.pop_front() {
            return status;
        }
        match state.grants.get_mut(&(op.domid, op.gref)) {
            Some(GrantKind::Transfer { received }) if received.is_none() => {
                let page = Page::new();
                page.copy_from(&op.page);
                *received = Some(page);
                state.counters.transfers += 1;
                GrantStatus::Okay
            }
            _ => GrantStatus::BadGntref,
        }
    }
}

impl Hypervisor for EmulatedHypervisor {
    fn grant_map(&self, ops: &mut [MapOp]) -> Result<(), HypercallError> {
        let mut state = lock(&self.state);
        state.counters.map_calls += 1;
        for op in ops.iter_mut() {
            if let Some(status) = state.map_faults.get(&(op.domid, op.gref)) {
                op.status = *status;
                continue;
            }
            let page = match state.grants.get(&(op.domid, op.gref)) {
                Some(GrantKind::Access { page, readonly }) if op.readonly || !readonly => {
                    page.clone()
                }
                Some(GrantKind::Access { .. }) => {
                    op.status = GrantStatus::PermissionDenied;
                    continue;
                }
                _ => {
                    op.status = GrantStatus::BadGntref;
                    continue;
                }
            };
            op.host.copy_from(&page);
            op.handle = state.next_handle;
            state.next_handle += 1;
            state.mapped.insert(op.handle, (op.domid, op.gref));
            state.counters.maps += 1;
            op.status = GrantStatus::Okay;
        }
        Ok(())
    }

    fn grant_unmap(&self, ops: &mut [UnmapOp]) -> Result<(), HypercallError> {
        let mut state = lock(&self.state);
        state.counters.unmap_calls += 1;
        for op in ops.iter_mut() {
            op.status = match state.mapped.remove(&op.handle) {
                Some(_) => {
                    state.counters.unmaps += 1;
                    GrantStatus::Okay
                }
                None => GrantStatus::BadHandle,
            };
        }
        Ok(())
    }

    fn multicall(&self, call: MultiCall<'_>) -> Result<(), HypercallError> {
        let mut state = lock(&self.state);
        state.counters.multicalls += 1;
        let MultiCall {
            entries,
            mmu,
            transfers,
            copies,
        } = call;
        let (mut mmu_cons, mut transfer_cons, mut copy_cons) = (0, 0, 0);
        for entry in entries.iter_mut() {
            entry.result = match entry.op {
                MultiCallOp::UpdateVaMapping { .. } => {
                    state.counters.va_updates += 1;
                    0
                }
                MultiCallOp::MmuUpdate { count } => {
                    if mmu_cons + count > mmu.len() {
                        return Err(HypercallError {
                            call: "mmu_update",
                            code: -22,
                        });
                    }
                    mmu_cons += count;
                    state.counters.mmu_updates += count;
                    0
                }
                MultiCallOp::GrantTransfer { count } => {
                    for op in &mut transfers[transfer_cons..transfer_cons + count] {
                        op.status = Self::do_transfer(&mut state, op);
                    }
                    transfer_cons += count;
                    0
                }
                MultiCallOp::GrantCopy { count } => {
                    for op in &mut copies[copy_cons..copy_cons + count] {
                        op.status = Self::do_copy(&mut state, op);
                    }
                    copy_cons += count;
                    0
                }
                MultiCallOp::Notify { port } => {
                    *state.notifications.entry(port).or_insert(0) += 1;
                    0
                }
            };
        }
        Ok(())
    }

    fn notify(&self, port: EventChannel) {
        let mut state = lock(&self.state);
        state.counters.notify_calls += 1;
        *state.notifications.entry(port).or_insert(0) += 1;
    }

    fn increase_reservation(&self, nr_frames: usize) -> Vec<Mfn> {
        let mut state = lock(&self.state);
        state.counters.reservations += 1;
        let n = nr_frames.min(state.frames_available);
        state.frames_available -= n;
        let first = state.next_mfn;
        state.next_mfn += n as Mfn;
        debug!("reserved {} of {} requested frames", n, nr_frames);
        (first..first + n as Mfn).collect()
    }

    fn supports_unmap_and_replace(&self) -> bool {
        lock(&self.state).unmap_and_replace
    }

    fn copy_grant_page(&self, handle: GrantHandle, _page: &Arc<Page>) -> PageCopy {
        let mut state = lock(&self.state);
        if state.page_copy == PageCopy::Copied && state.mapped.remove(&handle).is_none() {
            return PageCopy::Busy;
        }
        state.page_copy
    }
}
