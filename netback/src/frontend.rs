// SPDX-License-Identifier: Apache-2.0

//! Guest-side ring driver, for tests and the loopback demo.
//!
//! Owns both rings of one interface, grants its pages through an
//! [`EmulatedHypervisor`] and reassembles received packets.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::emul::EmulatedHypervisor;
use crate::grant::{DomId, EventChannel, GrantRef};
use crate::netif::{ConnectRequest, CreditLimit, InterfaceId};
use crate::page::Page;
use crate::protocol::{
    ExtraInfo, GsoInfo, MAX_SKB_FRAGS, NET_RX_RING_SIZE, NET_TX_RING_SIZE, NETRXF_EXTRA_INFO, NETRXF_MORE_DATA,
    NETTXF_EXTRA_INFO, NETTXF_MORE_DATA, NetifStatus, PAGE_SIZE, RxRequest, RxSlot, TxRequest, TxResponse,
    TxSlot, XEN_NETIF_EXTRA_TYPE_GSO,
};
use crate::ring::{RxFrontRing, RxSharedRing, TxFrontRing, TxSharedRing};

#[derive(Debug, PartialEq, Eq)]
pub enum FrontendError {
    /// Not enough free transmit slots for the packet.
    RingFull,
    /// Packet needs more slots than the backend accepts.
    TooLarge(usize),
}

impl fmt::Display for FrontendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendError::RingFull => write!(f, "transmit ring full"),
            FrontendError::TooLarge(len) => write!(f, "packet of {} bytes is too large", len),
        }
    }
}

impl std::error::Error for FrontendError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub data: Vec<u8>,
    pub flags: u16,
    pub gso: Option<GsoInfo>,
    /// First negative status seen in the chain.
    pub error: Option<i16>,
}

struct RxBuffer {
    gref: GrantRef,
    /// Granted page in copy mode; `None` for transfer grants.
    page: Option<Arc<Page>>,
}

struct PartialRx {
    packet: ReceivedPacket,
    more_data: bool,
    extras_pending: bool,
}

pub struct Frontend {
    hv: Arc<EmulatedHypervisor>,
    domid: DomId,
    evtchn: EventChannel,
    flip: bool,
    tx: TxFrontRing,
    rx: RxFrontRing,
    tx_grants: HashMap<u16, GrantRef>,
    rx_buffers: HashMap<u16, RxBuffer>,
    next_tx_id: u16,
    next_rx_id: u16,
    partial: Option<PartialRx>,
}

impl Frontend {
    pub fn new(hv: Arc<EmulatedHypervisor>, domid: DomId, evtchn: EventChannel, flip: bool) -> Self {
        Frontend {
            hv,
            domid,
            evtchn,
            flip,
            tx: TxFrontRing::new(TxSharedRing::new(NET_TX_RING_SIZE)),
            rx: RxFrontRing::new(RxSharedRing::new(NET_RX_RING_SIZE)),
            tx_grants: HashMap::new(),
            rx_buffers: HashMap::new(),
            next_tx_id: 0,
            next_rx_id: 0,
            partial: None,
        }
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn evtchn(&self) -> EventChannel {
        self.evtchn
    }

    pub fn connect_request(&self, handle: u32, credit: Option<CreditLimit>) -> ConnectRequest {
        ConnectRequest {
            id: InterfaceId {
                domid: self.domid,
                handle,
            },
            tx_ring: self.tx.shared().clone(),
            rx_ring: self.rx.shared().clone(),
            evtchn: self.evtchn,
            copying_receiver: !self.flip,
            can_queue: true,
            scatter_gather: true,
            tso: true,
            credit,
        }
    }

    /// Grants a read-only page holding `data` at `offset`.
    pub fn grant(&self, offset: usize, data: &[u8]) -> GrantRef {
        self.hv
            .grant_access(self.domid, Page::with_data(offset, data), true)
    }

    fn alloc_tx_id(&mut self) -> u16 {
        let id = self.next_tx_id;
        self.next_tx_id = self.next_tx_id.wrapping_add(1);
        id
    }

    /// Queues `payload` as one packet, split at page boundaries. Returns
    /// whether the backend must be notified.
    pub fn send(&mut self, payload: &[u8], gso: Option<u16>) -> Result<bool, FrontendError> {
        let chunks: Vec<&[u8]> = payload.chunks(PAGE_SIZE).collect();
        let slots = chunks.len().max(1) + usize::from(gso.is_some());
        if chunks.len() > MAX_SKB_FRAGS + 1 || payload.len() > u16::MAX as usize {
            return Err(FrontendError::TooLarge(payload.len()));
        }
        if (self.tx.free_requests() as usize) < slots {
            return Err(FrontendError::RingFull);
        }

        let mut requests = Vec::with_capacity(slots);
        for (i, chunk) in chunks.iter().enumerate() {
            let id = self.alloc_tx_id();
            let gref = self.grant(0, chunk);
            self.tx_grants.insert(id, gref);
            let mut flags = 0;
            if i + 1 < chunks.len() {
                flags |= NETTXF_MORE_DATA;
            }
            let size = if i == 0 { payload.len() } else { chunk.len() };
            requests.push(TxRequest {
                gref,
                offset: 0,
                flags,
                id,
                size: size as u16,
            });
        }
        let mut slots: Vec<TxSlot> = Vec::with_capacity(slots);
        for (i, mut req) in requests.into_iter().enumerate() {
            if i == 0 && gso.is_some() {
                req.flags |= NETTXF_EXTRA_INFO;
            }
            slots.push(TxSlot::Request(req));
            if let (0, Some(size)) = (i, gso) {
                slots.push(TxSlot::Extra(ExtraInfo::gso(size)));
            }
        }
        self.push_slots(&slots)
    }

    /// Publishes raw ring slots. The caller owns any grants they reference.
    pub fn push_slots(&mut self, slots: &[TxSlot]) -> Result<bool, FrontendError> {
        if (self.tx.free_requests() as usize) < slots.len() {
            return Err(FrontendError::RingFull);
        }
        for slot in slots {
            self.tx.push_request(*slot).map_err(|_| FrontendError::RingFull)?;
        }
        Ok(self.tx.push_requests_and_check_notify())
    }

    /// Collects transmit responses and revokes the grants they release.
    pub fn take_tx_responses(&mut self) -> Vec<TxResponse> {
        let mut out = Vec::new();
        loop {
            while let Some(rsp) = self.tx.pop_response() {
                if rsp.status == NetifStatus::Null.code() {
                    out.push(rsp);
                    continue;
                }
                if let Some(gref) = self.tx_grants.remove(&rsp.id) {
                    self.hv.end_access(self.domid, gref);
                }
                out.push(rsp);
            }
            if !self.tx.final_check_for_responses() {
                break;
            }
        }
        out
    }

    pub fn rx_posted(&self) -> usize {
        self.rx_buffers.len()
    }

    /// Posts up to `count` receive buffers. Returns whether the backend must
    /// be notified.
    pub fn post_rx_buffers(&mut self, count: usize) -> bool {
        for _ in 0..count {
            if self.rx.free_requests() == 0 {
                break;
            }
            let id = self.next_rx_id;
            self.next_rx_id = self.next_rx_id.wrapping_add(1) % NET_RX_RING_SIZE as u16;
            let buffer = if self.flip {
                RxBuffer {
                    gref: self.hv.grant_transfer(self.domid),
                    page: None,
                }
            } else {
                let page = Page::new();
                RxBuffer {
                    gref: self.hv.grant_access(self.domid, page.clone(), false),
                    page: Some(page),
                }
            };
            let gref = buffer.gref;
            self.rx_buffers.insert(id, buffer);
            if self.rx.push_request(RxRequest { id, gref }).is_err() {
                break;
            }
        }
        self.rx.push_requests_and_check_notify()
    }

    fn read_buffer(&mut self, id: u16, offset: usize, len: usize) -> Vec<u8> {
        let Some(buffer) = self.rx_buffers.remove(&id) else {
            return Vec::new();
        };
        let page = match buffer.page {
            Some(page) => Some(page),
            None => self.hv.transferred_page(self.domid, buffer.gref),
        };
        self.hv.end_access(self.domid, buffer.gref);
        page.map(|p| p.to_vec(offset, len)).unwrap_or_default()
    }

    /// Reassembles complete packets from the receive response ring.
    pub fn receive(&mut self) -> Vec<ReceivedPacket> {
        let mut packets = Vec::new();
        loop {
            while let Some(slot) = self.rx.pop_response() {
                match slot {
                    RxSlot::Extra(extra) => {
                        let Some(partial) = self.partial.as_mut() else {
                            continue;
                        };
                        if extra.kind == XEN_NETIF_EXTRA_TYPE_GSO {
                            partial.packet.gso = Some(extra.gso);
                        }
                        partial.extras_pending = extra.has_more();
                    }
                    RxSlot::Response(rsp) => {
                        let (data, error) = if rsp.status < 0 {
                            self.rx_buffers.remove(&rsp.id);
                            (Vec::new(), Some(rsp.status))
                        } else {
                            let data =
                                self.read_buffer(rsp.id, rsp.offset as usize, rsp.status as usize);
                            (data, None)
                        };
                        let partial = self.partial.get_or_insert_with(|| PartialRx {
                            packet: ReceivedPacket {
                                data: Vec::new(),
                                flags: rsp.flags,
                                gso: None,
                                error: None,
                            },
                            more_data: false,
                            extras_pending: false,
                        });
                        partial.packet.data.extend_from_slice(&data);
                        if partial.packet.error.is_none() {
                            partial.packet.error = error;
                        }
                        partial.more_data = rsp.has_flag(NETRXF_MORE_DATA);
                        partial.extras_pending |= rsp.has_flag(NETRXF_EXTRA_INFO);
                    }
                }
                if self
                    .partial
                    .as_ref()
                    .is_some_and(|p| !p.more_data && !p.extras_pending)
                {
                    packets.extend(self.partial.take().map(|p| p.packet));
                }
            }
            if !self.rx.final_check_for_responses() {
                break;
            }
        }
        packets
    }
}
