// SPDX-License-Identifier: Apache-2.0

//! Per-pass operation buffers and the calls that flush them.
//!
//! Buffers have a fixed capacity sized for the worst case of one pass and
//! are never grown; overrunning one is a bug.

use crate::grant::{
    CopyOp, EventChannel, GrantStatus, Hypervisor, MapOp, MmuUpdate, MultiCall, MultiCallEntry,
    MultiCallOp, TransferOp, UnmapOp,
};
use crate::protocol::{NET_RX_RING_SIZE, NetifStatus};
use crate::{Error, Result};

pub struct OpBuffer<T> {
    name: &'static str,
    ops: Vec<T>,
    capacity: usize,
}

impl<T> OpBuffer<T> {
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        OpBuffer {
            name,
            ops: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an operation and returns its index.
    pub fn push(&mut self, op: T) -> usize {
        assert!(
            self.ops.len() < self.capacity,
            "{} buffer overrun ({} entries)",
            self.name,
            self.capacity
        );
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn as_slice(&self) -> &[T] {
        &self.ops
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.ops
    }

    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.ops.last_mut()
    }
}

impl<T> std::ops::Index<usize> for OpBuffer<T> {
    type Output = T;

    fn index(&self, idx: usize) -> &T {
        &self.ops[idx]
    }
}

impl<T> std::ops::IndexMut<usize> for OpBuffer<T> {
    fn index_mut(&mut self, idx: usize) -> &mut T {
        &mut self.ops[idx]
    }
}

/// How one receive fragment was placed in the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxMeta {
    /// Guest request id the fragment landed in.
    pub id: u16,
    pub offset: u16,
    pub size: u16,
    /// Copied rather than transferred.
    pub copy: bool,
    /// Only set on a packet's head entry.
    pub gso_size: u16,
}

/// Everything one receive pass hands to the hypervisor.
pub struct RxBatch {
    pub mcl: OpBuffer<MultiCallEntry>,
    pub mmu: OpBuffer<MmuUpdate>,
    pub transfers: OpBuffer<TransferOp>,
    pub copies: OpBuffer<CopyOp>,
    pub meta: OpBuffer<RxMeta>,
    transfer_cons: usize,
    copy_cons: usize,
    pub meta_cons: usize,
}

impl Default for RxBatch {
    fn default() -> Self {
        RxBatch {
            mcl: OpBuffer::with_capacity("multicall", NET_RX_RING_SIZE + 3),
            mmu: OpBuffer::with_capacity("mmu update", NET_RX_RING_SIZE),
            transfers: OpBuffer::with_capacity("grant transfer", NET_RX_RING_SIZE),
            copies: OpBuffer::with_capacity("grant copy", NET_RX_RING_SIZE),
            meta: OpBuffer::with_capacity("rx meta", NET_RX_RING_SIZE),
            transfer_cons: 0,
            copy_cons: 0,
            meta_cons: 0,
        }
    }
}

/// Result of checking the operations of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketOutcome {
    pub status: NetifStatus,
    /// At least one operation asked to be retried.
    pub eagain: bool,
    /// First failing grant status, for logging.
    pub first_error: Option<GrantStatus>,
}

impl RxBatch {
    pub fn clear(&mut self) {
        self.mcl.clear();
        self.mmu.clear();
        self.transfers.clear();
        self.copies.clear();
        self.meta.clear();
        self.transfer_cons = 0;
        self.copy_cons = 0;
        self.meta_cons = 0;
    }

    /// Issues the pass as one multicall: page-table updates (the last one
    /// flushes the TLB), then one MMU update, one transfer and one copy
    /// entry. Returns false when there was nothing to issue.
    pub fn execute(&mut self, hv: &dyn Hypervisor) -> Result<bool> {
        if let Some(last) = self.mcl.last_mut() {
            if let MultiCallOp::UpdateVaMapping { flush_tlb, .. } = &mut last.op {
                *flush_tlb = true;
            }
        }
        if !self.mmu.is_empty() {
            self.mcl.push(MultiCallEntry::new(MultiCallOp::MmuUpdate {
                count: self.mmu.len(),
            }));
        }
        if !self.transfers.is_empty() {
            self.mcl.push(MultiCallEntry::new(MultiCallOp::GrantTransfer {
                count: self.transfers.len(),
            }));
        }
        if !self.copies.is_empty() {
            self.mcl.push(MultiCallEntry::new(MultiCallOp::GrantCopy {
                count: self.copies.len(),
            }));
        }
        if self.mcl.is_empty() {
            return Ok(false);
        }

        hv.multicall(MultiCall {
            entries: self.mcl.as_mut_slice(),
            mmu: self.mmu.as_slice(),
            transfers: self.transfers.as_mut_slice(),
            copies: self.copies.as_mut_slice(),
        })
        .map_err(Error::Hypercall)?;

        for entry in self.mcl.as_slice() {
            match entry.op {
                MultiCallOp::UpdateVaMapping { .. } | MultiCallOp::MmuUpdate { .. } => {
                    assert_eq!(entry.result, 0, "page table update failed: {:?}", entry.op);
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Checks the operations queued for one packet of `nr_frags + 1`
    /// fragments. A packet's operations are judged as a group, so their
    /// order within the packet does not matter.
    pub fn check_packet(&mut self, nr_frags: usize) -> PacketOutcome {
        let mut outcome = PacketOutcome {
            status: NetifStatus::Okay,
            eagain: false,
            first_error: None,
        };
        for i in 0..=nr_frags {
            let meta = self.meta[self.meta_cons + i];
            let status = if meta.copy {
                let status = self.copies[self.copy_cons].status;
                self.copy_cons += 1;
                status
            } else {
                let status = self.transfers[self.transfer_cons].status;
                self.transfer_cons += 1;
                assert_ne!(status, GrantStatus::BadPage, "transferred a page we do not own");
                status
            };
            if !status.is_ok() {
                outcome.status = NetifStatus::Error;
                outcome.eagain |= status == GrantStatus::Eagain;
                outcome.first_error.get_or_insert(status);
            }
        }
        outcome
    }
}

/// One map call for the whole pass; nothing when empty.
pub fn execute_map(hv: &dyn Hypervisor, ops: &mut OpBuffer<MapOp>) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    hv.grant_map(ops.as_mut_slice()).map_err(Error::Hypercall)
}

/// One unmap call for the whole pass; every unmap must succeed.
pub fn execute_unmap(hv: &dyn Hypervisor, ops: &mut OpBuffer<UnmapOp>) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    hv.grant_unmap(ops.as_mut_slice()).map_err(Error::Hypercall)?;
    for op in ops.as_slice() {
        assert!(op.status.is_ok(), "unmap of handle {} failed: {:?}", op.handle, op.status);
    }
    Ok(())
}

/// Delivers the pass's notifications: a direct notify for a single channel,
/// one multicall otherwise.
pub fn execute_notify(
    hv: &dyn Hypervisor,
    ports: &[EventChannel],
    mcl: &mut OpBuffer<MultiCallEntry>,
) -> Result<()> {
    match ports {
        [] => Ok(()),
        [port] => {
            hv.notify(*port);
            Ok(())
        }
        ports => {
            mcl.clear();
            for &port in ports {
                mcl.push(MultiCallEntry::new(MultiCallOp::Notify { port }));
            }
            hv.multicall(MultiCall {
                entries: mcl.as_mut_slice(),
                mmu: &[],
                transfers: &mut [],
                copies: &mut [],
            })
            .map_err(Error::Hypercall)
        }
    }
}
