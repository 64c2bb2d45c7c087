// SPDX-License-Identifier: Apache-2.0

//! Wire records exchanged with the guest over the shared rings.

use crate::grant::GrantRef;

pub const PAGE_SIZE: usize = 4096;
pub const ETH_HLEN: usize = 14;
/// Bytes of a transmitted packet pulled into the linear header.
pub const PKT_PROT_LEN: usize = 64;
/// Fragments needed for a 64 KiB packet plus two for misalignment.
pub const MAX_SKB_FRAGS: usize = 65536 / PAGE_SIZE + 2;

pub const NET_TX_RING_SIZE: usize = 256;
pub const NET_RX_RING_SIZE: usize = 256;
pub const MAX_PENDING_REQS: usize = 256;
/// Upper bound on frames requested from the hypervisor in one reservation.
pub const MAX_MFN_ALLOC: usize = 64;

pub const NETTXF_CSUM_BLANK: u16 = 1 << 0;
pub const NETTXF_DATA_VALIDATED: u16 = 1 << 1;
pub const NETTXF_MORE_DATA: u16 = 1 << 2;
pub const NETTXF_EXTRA_INFO: u16 = 1 << 3;

pub const NETRXF_DATA_VALIDATED: u16 = 1 << 0;
pub const NETRXF_CSUM_BLANK: u16 = 1 << 1;
pub const NETRXF_MORE_DATA: u16 = 1 << 2;
pub const NETRXF_EXTRA_INFO: u16 = 1 << 3;

pub const XEN_NETIF_EXTRA_TYPE_NONE: u8 = 0;
pub const XEN_NETIF_EXTRA_TYPE_GSO: u8 = 1;
pub const XEN_NETIF_EXTRA_TYPE_MAX: u8 = 2;
pub const XEN_NETIF_EXTRA_FLAG_MORE: u8 = 1 << 0;
pub const XEN_NETIF_GSO_TYPE_TCPV4: u8 = 1;

/// Response status carried back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum NetifStatus {
    Error = -1,
    Okay = 0,
    /// Placeholder response for a consumed extra-info slot.
    Null = 1,
}

impl NetifStatus {
    pub fn code(self) -> i16 {
        self as i16
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxRequest {
    pub gref: GrantRef,
    pub offset: u16,
    pub flags: u16,
    pub id: u16,
    pub size: u16,
}

impl TxRequest {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GsoInfo {
    pub size: u16,
    pub kind: u8,
    pub pad: u8,
    pub features: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraInfo {
    pub kind: u8,
    pub flags: u8,
    pub gso: GsoInfo,
}

impl ExtraInfo {
    pub fn gso(size: u16) -> Self {
        ExtraInfo {
            kind: XEN_NETIF_EXTRA_TYPE_GSO,
            flags: 0,
            gso: GsoInfo {
                size,
                kind: XEN_NETIF_GSO_TYPE_TCPV4,
                pad: 0,
                features: 0,
            },
        }
    }

    pub fn has_more(&self) -> bool {
        self.flags & XEN_NETIF_EXTRA_FLAG_MORE != 0
    }
}

/// One entry of the transmit request ring.
///
/// A slot is read as whatever the consumer expects at that position: a
/// request where a request is due, an extra-info record after a request
/// flagged with `NETTXF_EXTRA_INFO`. Reading the other variant yields a
/// zeroed record, which the consumer then rejects as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSlot {
    Request(TxRequest),
    Extra(ExtraInfo),
}

impl Default for TxSlot {
    fn default() -> Self {
        TxSlot::Request(TxRequest::default())
    }
}

impl TxSlot {
    pub fn request(&self) -> TxRequest {
        match self {
            TxSlot::Request(req) => *req,
            TxSlot::Extra(_) => TxRequest::default(),
        }
    }

    pub fn extra(&self) -> ExtraInfo {
        match self {
            TxSlot::Extra(extra) => *extra,
            TxSlot::Request(_) => ExtraInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxResponse {
    pub id: u16,
    pub status: i16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxRequest {
    pub id: u16,
    pub gref: GrantRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxResponse {
    pub id: u16,
    pub offset: u16,
    pub flags: u16,
    /// Byte count on success, negative status otherwise.
    pub status: i16,
}

impl RxResponse {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// One entry of the receive response ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxSlot {
    Response(RxResponse),
    Extra(ExtraInfo),
}

impl Default for RxSlot {
    fn default() -> Self {
        RxSlot::Response(RxResponse::default())
    }
}
