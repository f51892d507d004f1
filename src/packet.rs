use pnet::packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::{MutablePacket, Packet};
use std::net::Ipv4Addr;

use crate::error::{Result, RouterError};
use crate::types::MacAddr;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const ARP_PACKET_LEN: usize = 28;
pub const IPV4_HEADER_LEN: usize = 20;

/// Fields of an ARP message together with the Ethernet source it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpMessage {
    pub eth_src: MacAddr,
    pub sender_hw: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ArpRequest(ArpMessage),
    ArpReply(ArpMessage),
    Ipv4 { eth_src: MacAddr, src: Ipv4Addr, dst: Ipv4Addr },
    Ipv6,
    Other,
}

pub fn classify(data: &[u8]) -> Result<Frame> {
    let eth = EthernetPacket::new(data).ok_or(RouterError::MalformedFrame("short ethernet header"))?;

    match eth.get_ethertype() {
        EtherTypes::Arp => {
            let arp = ArpPacket::new(eth.payload()).ok_or(RouterError::MalformedFrame("short arp packet"))?;
            let message = ArpMessage {
                eth_src: eth.get_source(),
                sender_hw: arp.get_sender_hw_addr(),
                sender_ip: arp.get_sender_proto_addr(),
                target_hw: arp.get_target_hw_addr(),
                target_ip: arp.get_target_proto_addr(),
            };
            Ok(match arp.get_operation() {
                ArpOperations::Request => Frame::ArpRequest(message),
                ArpOperations::Reply => Frame::ArpReply(message),
                _ => Frame::Other,
            })
        }
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(eth.payload()).ok_or(RouterError::MalformedFrame("short ipv4 header"))?;
            Ok(Frame::Ipv4 {
                eth_src: eth.get_source(),
                src: ip.get_source(),
                dst: ip.get_destination(),
            })
        }
        EtherTypes::Ipv6 => Ok(Frame::Ipv6),
        _ => Ok(Frame::Other),
    }
}

/// Destination IPv4 address of an Ethernet/IPv4 frame.
pub fn ipv4_destination(data: &[u8]) -> Option<Ipv4Addr> {
    let eth = EthernetPacket::new(data)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    Ipv4Packet::new(eth.payload()).map(|ip| ip.get_destination())
}

fn build_arp(
    operation: ArpOperation,
    eth_dst: MacAddr,
    sender_hw: MacAddr,
    sender_ip: Ipv4Addr,
    target_hw: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
    {
        let Some(mut eth) = MutableEthernetPacket::new(&mut buf) else {
            return Vec::new();
        };
        eth.set_destination(eth_dst);
        eth.set_source(sender_hw);
        eth.set_ethertype(EtherTypes::Arp);

        let Some(mut arp) = MutableArpPacket::new(eth.payload_mut()) else {
            return Vec::new();
        };
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(operation);
        arp.set_sender_hw_addr(sender_hw);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(target_hw);
        arp.set_target_proto_addr(target_ip);
    }
    buf
}

/// Broadcast "who has `target_ip`? tell `sender_ip`".
pub fn arp_request(sender_hw: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    build_arp(
        ArpOperations::Request,
        MacAddr::broadcast(),
        sender_hw,
        sender_ip,
        MacAddr::zero(),
        target_ip,
    )
}

/// Answer `request` claiming `request.target_ip` is at `hw_addr`.
pub fn arp_reply(request: &ArpMessage, hw_addr: MacAddr) -> Vec<u8> {
    build_arp(
        ArpOperations::Reply,
        request.eth_src,
        hw_addr,
        request.target_ip,
        request.sender_hw,
        request.sender_ip,
    )
}

/// Rewrites the Ethernet addresses of `frame` in place.
pub fn rewrite_macs(frame: &mut [u8], src: MacAddr, dst: MacAddr) -> Result<()> {
    let mut eth = MutableEthernetPacket::new(frame).ok_or(RouterError::MalformedFrame("short ethernet header"))?;
    eth.set_source(src);
    eth.set_destination(dst);
    Ok(())
}

/// Minimal ICMP-carrying IPv4 frame, used to inject data-plane traffic.
pub fn ipv4_frame(eth_src: MacAddr, eth_dst: MacAddr, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let ip_len = IPV4_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ip_len];
    {
        let Some(mut eth) = MutableEthernetPacket::new(&mut buf) else {
            return Vec::new();
        };
        eth.set_destination(eth_dst);
        eth.set_source(eth_src);
        eth.set_ethertype(EtherTypes::Ipv4);

        let Some(mut ip) = MutableIpv4Packet::new(eth.payload_mut()) else {
            return Vec::new();
        };
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(ip_len as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
        ip.set_source(src);
        ip.set_destination(dst);
        ip.set_payload(payload);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    buf
}
