// SPDX-License-Identifier: Apache-2.0

//! Packets handed between the backend and the host network stack.

use std::sync::Arc;

use crate::netif::InterfaceId;
use crate::page::{FragPage, Page};
use crate::protocol::{GsoInfo, MAX_SKB_FRAGS, PAGE_SIZE};

#[derive(Debug, Clone)]
pub struct Fragment {
    pub page: FragPage,
    pub offset: usize,
    pub size: usize,
}

impl Fragment {
    pub fn local(page: Arc<Page>, offset: usize, size: usize) -> Self {
        Fragment {
            page: FragPage::Local(page),
            offset,
            size,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Checksum {
    #[default]
    None,
    /// Verified by someone upstream.
    Unnecessary,
    /// Still to be filled in; the data is known good.
    Partial,
}

/// A packet: a linear head plus page fragments.
#[derive(Debug, Clone)]
pub struct Packet {
    pub head: Fragment,
    pub frags: Vec<Fragment>,
    pub checksum: Checksum,
    pub gso: Option<GsoInfo>,
}

impl Packet {
    /// Lays `data` out in fresh local pages: the head takes the first page,
    /// the rest goes into page-sized fragments.
    pub fn from_bytes(data: &[u8]) -> Packet {
        let mut chunks = data.chunks(PAGE_SIZE);
        let head = chunks.next().unwrap_or(&[]);
        Packet {
            head: Fragment::local(Page::with_data(0, head), 0, head.len()),
            frags: chunks
                .map(|c| Fragment::local(Page::with_data(0, c), 0, c.len()))
                .collect(),
            checksum: Checksum::None,
            gso: None,
        }
    }

    pub fn len(&self) -> usize {
        self.head.size + self.frags.iter().map(|f| f.size).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nr_frags(&self) -> usize {
        self.frags.len()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for frag in std::iter::once(&self.head).chain(&self.frags) {
            out.extend_from_slice(&frag.page.page().to_vec(frag.offset, frag.size));
        }
        out
    }

    pub fn header_crosses_page(&self) -> bool {
        self.head.offset + self.head.size > PAGE_SIZE
    }

    /// Rebuilds the packet in private pages, dropping any foreign page it
    /// was holding. `None` if it does not fit in the fragment limit.
    pub fn copy_to_local(&self) -> Option<Packet> {
        let mut copy = Packet::from_bytes(&self.to_vec());
        if copy.nr_frags() > MAX_SKB_FRAGS {
            return None;
        }
        copy.checksum = self.checksum;
        copy.gso = self.gso;
        Some(copy)
    }

    /// Copies into a single page. `None` if the packet is larger than one.
    pub fn linearize(&self) -> Option<Packet> {
        if self.len() > PAGE_SIZE {
            return None;
        }
        self.copy_to_local()
    }
}

/// Where the backend delivers packets transmitted by guests.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, from: InterfaceId, packet: Packet);
}

impl<F> PacketSink for F
where
    F: Fn(InterfaceId, Packet) + Send + Sync,
{
    fn deliver(&self, from: InterfaceId, packet: Packet) {
        self(from, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_layout() {
        let data: Vec<u8> = (0..10000u32).map(|i| i as u8).collect();
        let packet = Packet::from_bytes(&data);
        assert_eq!(packet.head.size, PAGE_SIZE);
        assert_eq!(packet.nr_frags(), 2);
        assert_eq!(packet.len(), 10000);
        assert_eq!(packet.to_vec(), data);
        assert!(!packet.header_crosses_page());
    }

    #[test]
    fn test_linearize_limits() {
        let small = Packet::from_bytes(&[7u8; 100]);
        assert_eq!(small.linearize().unwrap().to_vec(), vec![7u8; 100]);
        let big = Packet::from_bytes(&[7u8; PAGE_SIZE + 1]);
        assert!(big.linearize().is_none());
    }

    #[test]
    fn test_closure_sink() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |from: InterfaceId, packet: Packet| seen.lock().unwrap().push((from, packet.len()));
        let id = InterfaceId { domid: 1, handle: 0 };
        sink.deliver(id, Packet::from_bytes(&[0u8; 60]));
        assert_eq!(seen.lock().unwrap()[0], (id, 60));
    }
}
