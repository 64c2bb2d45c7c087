// SPDX-License-Identifier: Apache-2.0

//! Hypervisor primitives used by the engine: grant map/unmap/copy/transfer,
//! batched multicalls, event channel notification and frame reservation.

use std::fmt;
use std::sync::Arc;

use crate::page::{Mfn, Page, Pfn};

pub type DomId = u16;
pub type GrantRef = u32;
pub type GrantHandle = u32;
pub type EventChannel = u32;

/// Per-operation status written back by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrantStatus {
    #[default]
    Okay,
    GeneralError,
    BadDomain,
    BadGntref,
    BadHandle,
    BadVirtAddr,
    BadDevAddr,
    NoDeviceSpace,
    PermissionDenied,
    BadPage,
    BadCopyArg,
    AddressTooBig,
    /// Transient; the operation may be retried.
    Eagain,
}

impl GrantStatus {
    pub fn is_ok(self) -> bool {
        self == GrantStatus::Okay
    }

    pub fn code(self) -> i16 {
        match self {
            GrantStatus::Okay => 0,
            GrantStatus::GeneralError => -1,
            GrantStatus::BadDomain => -2,
            GrantStatus::BadGntref => -3,
            GrantStatus::BadHandle => -4,
            GrantStatus::BadVirtAddr => -5,
            GrantStatus::BadDevAddr => -6,
            GrantStatus::NoDeviceSpace => -7,
            GrantStatus::PermissionDenied => -8,
            GrantStatus::BadPage => -9,
            GrantStatus::BadCopyArg => -10,
            GrantStatus::AddressTooBig => -11,
            GrantStatus::Eagain => -12,
        }
    }
}

/// Map a foreign grant onto a local page.
#[derive(Debug)]
pub struct MapOp {
    pub domid: DomId,
    pub gref: GrantRef,
    pub readonly: bool,
    pub host: Arc<Page>,
    pub status: GrantStatus,
    pub handle: GrantHandle,
}

impl MapOp {
    pub fn readonly(domid: DomId, gref: GrantRef, host: Arc<Page>) -> Self {
        MapOp {
            domid,
            gref,
            readonly: true,
            host,
            status: GrantStatus::Okay,
            handle: 0,
        }
    }
}

#[derive(Debug)]
pub struct UnmapOp {
    pub handle: GrantHandle,
    pub host: Arc<Page>,
    pub status: GrantStatus,
}

#[derive(Debug, Clone)]
pub enum CopySource {
    /// A page granted by another domain.
    Grant { domid: DomId, gref: GrantRef },
    /// A page owned by the backend.
    Local { mfn: Mfn, page: Arc<Page> },
}

/// Copy bytes into a page granted by the destination domain.
#[derive(Debug, Clone)]
pub struct CopyOp {
    pub source: CopySource,
    pub source_offset: usize,
    pub dest_domid: DomId,
    pub dest_gref: GrantRef,
    pub dest_offset: usize,
    pub len: usize,
    pub status: GrantStatus,
}

/// Hand ownership of a local frame to the destination domain.
#[derive(Debug, Clone)]
pub struct TransferOp {
    pub mfn: Mfn,
    pub page: Arc<Page>,
    pub domid: DomId,
    pub gref: GrantRef,
    pub status: GrantStatus,
}

/// Machine-to-physical table update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuUpdate {
    pub mfn: Mfn,
    pub pfn: Pfn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiCallOp {
    UpdateVaMapping { pfn: Pfn, mfn: Mfn, flush_tlb: bool },
    MmuUpdate { count: usize },
    GrantTransfer { count: usize },
    GrantCopy { count: usize },
    Notify { port: EventChannel },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiCallEntry {
    pub op: MultiCallOp,
    pub result: i64,
}

impl MultiCallEntry {
    pub fn new(op: MultiCallOp) -> Self {
        MultiCallEntry { op, result: 0 }
    }
}

/// One privileged batch. Class entries consume their records from the
/// matching slice in order.
pub struct MultiCall<'a> {
    pub entries: &'a mut [MultiCallEntry],
    pub mmu: &'a [MmuUpdate],
    pub transfers: &'a mut [TransferOp],
    pub copies: &'a mut [CopyOp],
}

/// Outcome of copying a still-mapped foreign page into local memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCopy {
    /// The page now holds a private copy and the grant is unmapped.
    Copied,
    /// Transient failure, try again on a later pass.
    Retry,
    /// The page is pinned elsewhere; wait for it to be released.
    Busy,
}

/// A privileged call failed as a whole, as opposed to per-operation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypercallError {
    pub call: &'static str,
    pub code: i64,
}

impl fmt::Display for HypercallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with {}", self.call, self.code)
    }
}

impl std::error::Error for HypercallError {}

pub trait Hypervisor: Send + Sync {
    fn grant_map(&self, ops: &mut [MapOp]) -> Result<(), HypercallError>;

    fn grant_unmap(&self, ops: &mut [UnmapOp]) -> Result<(), HypercallError>;

    fn multicall(&self, call: MultiCall<'_>) -> Result<(), HypercallError>;

    fn notify(&self, port: EventChannel);

    /// Asks for up to `nr_frames` fresh machine frames.
    fn increase_reservation(&self, nr_frames: usize) -> Vec<Mfn>;

    /// Whether a mapped grant can be replaced by a private copy in place.
    fn supports_unmap_and_replace(&self) -> bool {
        false
    }

    fn copy_grant_page(&self, _handle: GrantHandle, _page: &Arc<Page>) -> PageCopy {
        PageCopy::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GrantStatus::Okay.code(), 0);
        assert_eq!(GrantStatus::BadPage.code(), -9);
        assert_eq!(GrantStatus::Eagain.code(), -12);
        assert!(!GrantStatus::Eagain.is_ok());
    }
}
