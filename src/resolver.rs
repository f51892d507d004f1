use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{MacAddr, PortNo};

pub const DEFAULT_ARP_CAPACITY: usize = 1024;
pub const DEFAULT_PENDING_CAPACITY: usize = 64;
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub hw_addr: MacAddr,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpEntryView {
    pub ip: String,
    pub hw_addr: String,
    pub last_update: String,
}

/// IPv4 -> MAC bindings learned from ARP replies or set by an operator.
#[derive(Debug, Clone)]
pub struct ArpCache {
    entries: HashMap<Ipv4Addr, ArpEntry>,
    capacity: usize,
}

impl ArpCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn lookup(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        self.entries.get(ip).map(|entry| entry.hw_addr)
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<&ArpEntry> {
        self.entries.get(ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, ip: Ipv4Addr, hw_addr: MacAddr) {
        self.insert_at(ip, hw_addr, Utc::now());
    }

    pub fn insert_at(&mut self, ip: Ipv4Addr, hw_addr: MacAddr, now: DateTime<Utc>) {
        if !self.entries.contains_key(&ip) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_update)
                .map(|(ip, _)| *ip);
            if let Some(oldest) = oldest {
                debug!("ARP table full, evicting {}", oldest);
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(ip, ArpEntry { hw_addr, last_update: now });
    }

    /// Entries sorted by address.
    pub fn to_view(&self) -> Vec<ArpEntryView> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(ip, _)| **ip);
        entries
            .into_iter()
            .map(|(ip, entry)| ArpEntryView {
                ip: ip.to_string(),
                hw_addr: entry.hw_addr.to_string(),
                last_update: entry.last_update.format("%Y-%m-%d %H:%M:%S").to_string(),
            })
            .collect()
    }
}

/// A data frame parked until its destination MAC is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPacket {
    pub frame: Vec<u8>,
    pub dst: Ipv4Addr,
    pub out_port: PortNo,
    pub queued_at: Instant,
}

/// FIFO of frames waiting for ARP resolution. Bounded: when full the
/// oldest frame is dropped to make room.
#[derive(Debug, Clone)]
pub struct PendingBuffer {
    packets: VecDeque<PendingPacket>,
    capacity: usize,
    timeout: Duration,
}

impl PendingBuffer {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            packets: VecDeque::new(),
            capacity: capacity.max(1),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingPacket> {
        self.packets.iter()
    }

    pub fn push(&mut self, packet: PendingPacket) {
        if self.packets.len() >= self.capacity {
            if let Some(dropped) = self.packets.pop_front() {
                warn!("pending buffer full, dropping oldest packet to {}", dropped.dst);
            }
        }
        self.packets.push_back(packet);
    }

    /// Removes, in order, every packet for which `deliver` reports success.
    /// Packets it declines stay queued in arrival order.
    pub fn drain_deliverable<F>(&mut self, mut deliver: F) -> usize
    where
        F: FnMut(&PendingPacket) -> bool,
    {
        let before = self.packets.len();
        self.packets.retain(|packet| !deliver(packet));
        before - self.packets.len()
    }

    /// Drops packets queued longer than the timeout.
    pub fn prune_at(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.packets.len();
        self.packets
            .retain(|packet| now.saturating_duration_since(packet.queued_at) <= timeout);
        before - self.packets.len()
    }
}
