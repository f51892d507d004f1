use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

pub use pnet::util::MacAddr;

/// Datapath id of a switch.
pub type SwitchId = u64;

/// Port number on a switch.
pub type PortNo = u32;

/// Routing table key. Always stored with host bits cleared.
pub type Subnet = Ipv4Net;

pub const DPID_LEN: usize = 16;
pub const PORT_NO_LEN: usize = 8;

pub fn dpid_to_str(dpid: SwitchId) -> String {
    format!("{:016x}", dpid)
}

pub fn port_no_to_str(port_no: PortNo) -> String {
    format!("{:08x}", port_no)
}

pub fn str_to_dpid(s: &str) -> Option<SwitchId> {
    if s.len() != DPID_LEN {
        return None;
    }
    SwitchId::from_str_radix(s, 16).ok()
}

pub fn str_to_port_no(s: &str) -> Option<PortNo> {
    if s.len() != PORT_NO_LEN {
        return None;
    }
    PortNo::from_str_radix(s, 16).ok()
}

/// Builds a normalized subnet from an address inside it and a prefix length.
pub fn subnet_of(addr: Ipv4Addr, prefix_len: u8) -> Option<Subnet> {
    Ipv4Net::new(addr, prefix_len).ok().map(|net| net.trunc())
}

/// Single-host subnet used for per-host forwarding rules.
pub fn host_subnet(addr: Ipv4Addr) -> Subnet {
    Ipv4Net::from(addr)
}
