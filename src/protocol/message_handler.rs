use log::{debug, info, warn};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tokio::time::Instant;

use super::SwitchState;
use crate::error::Result;
use crate::packet::{self, ArpMessage, Frame};
use crate::port::Port;
use crate::resolver::PendingPacket;
use crate::southbound::{Datapath, FlowMatch, FlowRule};
use crate::types::{MacAddr, PortNo, dpid_to_str, host_subnet};

/// Entry point for frames the switch could not forward on its own.
pub fn handle_packet_in(state: &mut SwitchState, datapath: &dyn Datapath, in_port: PortNo, data: &[u8]) -> Result<()> {
    match packet::classify(data)? {
        Frame::ArpRequest(msg) => handle_arp_request(state, datapath, in_port, &msg),
        Frame::ArpReply(msg) => handle_arp_reply(state, datapath, in_port, &msg).map(|_| ()),
        Frame::Ipv4 { dst, .. } => handle_ipv4(state, datapath, dst, data).map(|_| ()),
        Frame::Ipv6 => {
            debug!("ipv6 is not supported, dropped (dpid={})", dpid_to_str(state.id));
            Ok(())
        }
        Frame::Other => Ok(()),
    }
}

/// Answers a host asking for the MAC of its gateway. Requests for any
/// other address are ignored.
pub fn handle_arp_request(
    state: &mut SwitchState,
    datapath: &dyn Datapath,
    in_port: PortNo,
    msg: &ArpMessage,
) -> Result<()> {
    info!(
        "ARP request: who has {}? tell {} (dpid={})",
        msg.target_ip,
        msg.sender_ip,
        dpid_to_str(state.id)
    );

    let Some(port) = state.ports.get(&in_port) else {
        debug!("ARP request on unknown port {} (dpid={})", in_port, dpid_to_str(state.id));
        return Ok(());
    };
    match &port.gateway {
        Some(gateway) if gateway.ipv4 == msg.target_ip => {}
        _ => {
            debug!("ARP request for {} is not for a gateway, ignored", msg.target_ip);
            return Ok(());
        }
    }

    datapath.send_frame(in_port, &packet::arp_reply(msg, port.hw_addr))?;
    info!("ARP replied: {} - {}", port.hw_addr, msg.target_ip);
    Ok(())
}

/// Learns the sender binding of a reply addressed to one of our gateways
/// and replays every buffered packet that can now be delivered. Returns
/// how many packets were replayed.
pub fn handle_arp_reply(
    state: &mut SwitchState,
    datapath: &dyn Datapath,
    in_port: PortNo,
    msg: &ArpMessage,
) -> Result<usize> {
    info!("ARP reply from {} (dpid={})", msg.sender_ip, dpid_to_str(state.id));

    let addressed_to_gateway = state
        .ports
        .get(&in_port)
        .and_then(|port| port.gateway.as_ref())
        .is_some_and(|gateway| gateway.ipv4 == msg.target_ip);
    if !addressed_to_gateway {
        debug!("ARP reply to {} not addressed to a gateway, ignored", msg.target_ip);
        return Ok(0);
    }

    info!("update ARP entry: {} - {} (dpid={})", msg.eth_src, msg.sender_ip, dpid_to_str(state.id));
    state.arp.insert(msg.sender_ip, msg.eth_src);

    let replayed = replay_pending(state, datapath);
    if replayed > 0 {
        info!("{} buffered packet(s) delivered (dpid={})", replayed, dpid_to_str(state.id));
    }
    Ok(replayed)
}

/// Delivers buffered packets whose destination is now resolved, keeping
/// the rest queued in order. Each resolved host gets its rule once.
pub fn replay_pending(state: &mut SwitchState, datapath: &dyn Datapath) -> usize {
    let SwitchState {
        ports,
        arp,
        pending,
        match_ip_protocol,
        flow_priority,
        ..
    } = state;
    let mut programmed: HashSet<Ipv4Addr> = HashSet::new();

    pending.drain_deliverable(|packet| {
        let Some(dst_mac) = arp.lookup(&packet.dst) else {
            return false;
        };
        let Some(port) = ports.get(&packet.out_port) else {
            return false;
        };
        if !programmed.contains(&packet.dst) {
            if let Err(e) = install_host_rule(datapath, port, dst_mac, packet.dst, *match_ip_protocol, *flow_priority) {
                warn!("replay to {} failed: {}", packet.dst, e);
                return false;
            }
            programmed.insert(packet.dst);
        }
        match send_to_host(datapath, port, dst_mac, &packet.frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("replay to {} failed: {}", packet.dst, e);
                false
            }
        }
    })
}

/// Returns `true` when the frame was delivered, `false` when it was
/// dropped or parked awaiting resolution.
pub fn handle_ipv4(state: &mut SwitchState, datapath: &dyn Datapath, dst: Ipv4Addr, data: &[u8]) -> Result<bool> {
    if dst == Ipv4Addr::BROADCAST {
        return Ok(false);
    }
    deliver_to_host(state, datapath, dst, data.to_vec())
}

/// Final hop: sends `frame` to a host on a directly attached subnet,
/// resolving its MAC first when needed.
pub fn deliver_to_host(state: &mut SwitchState, datapath: &dyn Datapath, dst: Ipv4Addr, frame: Vec<u8>) -> Result<bool> {
    let Some(port) = state.find_port_by_ip(dst) else {
        warn!("cannot find output port for {} (dpid={})", dst, dpid_to_str(state.id));
        return Ok(false);
    };

    if let Some(dst_mac) = state.arp.lookup(&dst) {
        forward_to_host(datapath, port, dst_mac, dst, &frame, state.match_ip_protocol, state.flow_priority)?;
        info!("packet delivered to {} (dpid={})", dst, dpid_to_str(state.id));
        return Ok(true);
    }

    let out_port = port.port_no;
    let Some(gateway_ip) = port.gateway.as_ref().map(|gw| gw.ipv4) else {
        return Ok(false);
    };
    datapath.send_frame(out_port, &packet::arp_request(port.hw_addr, gateway_ip, dst))?;
    info!("no ARP entry for {}, packet buffered (dpid={})", dst, dpid_to_str(state.id));

    state.pending.push(PendingPacket {
        frame,
        dst,
        out_port,
        queued_at: Instant::now(),
    });
    Ok(false)
}

fn forward_to_host(
    datapath: &dyn Datapath,
    port: &Port,
    dst_mac: MacAddr,
    dst: Ipv4Addr,
    frame: &[u8],
    nw_proto: Option<u8>,
    priority: u16,
) -> Result<()> {
    install_host_rule(datapath, port, dst_mac, dst, nw_proto, priority)?;
    send_to_host(datapath, port, dst_mac, frame)
}

fn install_host_rule(
    datapath: &dyn Datapath,
    port: &Port,
    dst_mac: MacAddr,
    dst: Ipv4Addr,
    nw_proto: Option<u8>,
    priority: u16,
) -> Result<()> {
    let rule = FlowRule::rewrite_and_output(
        FlowMatch::ipv4_dst(host_subnet(dst), nw_proto),
        port.hw_addr,
        dst_mac,
        port.port_no,
        priority,
    );
    datapath.install_flow(&rule)
}

fn send_to_host(datapath: &dyn Datapath, port: &Port, dst_mac: MacAddr, frame: &[u8]) -> Result<()> {
    let mut frame = frame.to_vec();
    packet::rewrite_macs(&mut frame, port.hw_addr, dst_mac)?;
    datapath.send_frame(port.port_no, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Gateway;
    use crate::protocol::NodeOptions;
    use crate::protocol::routing_table::TimerConfig;
    use crate::southbound::{DatapathEvent, RecordingDatapath};
    use pnet::packet::ethernet::EthernetPacket;
    use std::net::Ipv6Addr;
    use std::time::Duration;

    const GW_MAC: MacAddr = MacAddr(0, 0, 0, 0, 1, 1);
    const HOST_MAC: MacAddr = MacAddr(0, 0, 0, 0, 0, 0x50);
    const GW_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 50);

    fn state() -> SwitchState {
        let mut state = SwitchState::new(
            1,
            "s1",
            &NodeOptions::default(),
            TimerConfig::from_advertise_interval(Duration::from_secs(30)),
        );
        state.ports.insert(1, Port::new(1, 1, GW_MAC, "s1-eth1"));
        state
            .set_gateway(Gateway::new("s1-eth1".into(), 1, GW_IP, 24, Ipv6Addr::UNSPECIFIED, 0).unwrap())
            .unwrap();
        state
    }

    fn data_frame(dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        packet::ipv4_frame(MacAddr(0, 0, 0, 0, 2, 1), GW_MAC, Ipv4Addr::new(10, 0, 2, 20), dst, payload)
    }

    fn reply_from(sender_ip: Ipv4Addr, sender_mac: MacAddr) -> ArpMessage {
        ArpMessage {
            eth_src: sender_mac,
            sender_hw: sender_mac,
            sender_ip,
            target_hw: GW_MAC,
            target_ip: GW_IP,
        }
    }

    #[test]
    fn gateway_request_gets_a_reply() {
        let mut state = state();
        let dp = RecordingDatapath::new();
        let request = ArpMessage {
            eth_src: HOST_MAC,
            sender_hw: HOST_MAC,
            sender_ip: HOST_IP,
            target_hw: MacAddr::zero(),
            target_ip: GW_IP,
        };
        handle_arp_request(&mut state, &dp, 1, &request).unwrap();

        let frames = dp.frames();
        assert_eq!(frames.len(), 1);
        match packet::classify(&frames[0].1).unwrap() {
            Frame::ArpReply(reply) => {
                assert_eq!(reply.sender_hw, GW_MAC);
                assert_eq!(reply.sender_ip, GW_IP);
                assert_eq!(reply.target_ip, HOST_IP);
            }
            other => panic!("expected ARP reply, got {:?}", other),
        }

        // not our address: no proxy reply
        dp.clear();
        let other = ArpMessage { target_ip: Ipv4Addr::new(10, 0, 1, 77), ..request };
        handle_arp_request(&mut state, &dp, 1, &other).unwrap();
        assert!(dp.events().is_empty());
    }

    #[test]
    fn unresolved_host_is_buffered_then_replayed() {
        let mut state = state();
        let dp = RecordingDatapath::new();

        let delivered = handle_ipv4(&mut state, &dp, HOST_IP, &data_frame(HOST_IP, b"p1")).unwrap();
        assert!(!delivered);
        assert!(dp.installed().is_empty());
        let frames = dp.frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(packet::classify(&frames[0].1).unwrap(), Frame::ArpRequest(m) if m.target_ip == HOST_IP));
        assert_eq!(state.pending.len(), 1);

        dp.clear();
        let replayed = handle_arp_reply(&mut state, &dp, 1, &reply_from(HOST_IP, HOST_MAC)).unwrap();
        assert_eq!(replayed, 1);
        assert!(state.pending.is_empty());

        let rules = dp.installed();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].matches.nw_dst.to_string(), "10.0.1.50/32");

        let frames = dp.frames();
        assert_eq!(frames.len(), 1);
        let eth = EthernetPacket::new(&frames[0].1).unwrap();
        assert_eq!((eth.get_source(), eth.get_destination()), (GW_MAC, HOST_MAC));
    }

    #[test]
    fn replay_preserves_order_and_leaves_other_hosts_queued() {
        let mut state = state();
        let dp = RecordingDatapath::new();
        let other = Ipv4Addr::new(10, 0, 1, 60);

        handle_ipv4(&mut state, &dp, HOST_IP, &data_frame(HOST_IP, b"p1")).unwrap();
        handle_ipv4(&mut state, &dp, other, &data_frame(other, b"x")).unwrap();
        handle_ipv4(&mut state, &dp, HOST_IP, &data_frame(HOST_IP, b"p2")).unwrap();
        handle_ipv4(&mut state, &dp, HOST_IP, &data_frame(HOST_IP, b"p3")).unwrap();

        // unrelated reply: binding learned for a host nobody waits for
        dp.clear();
        let stranger = handle_arp_reply(&mut state, &dp, 1, &reply_from(Ipv4Addr::new(10, 0, 1, 99), MacAddr(9, 9, 9, 9, 9, 9))).unwrap();
        assert_eq!(stranger, 0);
        assert_eq!(state.pending.len(), 4);

        handle_arp_reply(&mut state, &dp, 1, &reply_from(HOST_IP, HOST_MAC)).unwrap();
        let payloads: Vec<Vec<u8>> = dp
            .frames()
            .into_iter()
            .map(|(_, frame)| frame[frame.len() - 2..].to_vec())
            .collect();
        assert_eq!(payloads, vec![b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]);
        // one host rule covers all three replayed frames
        let rules = dp.installed();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].matches.nw_dst.to_string(), "10.0.1.50/32");
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending.iter().next().unwrap().dst, other);
    }

    #[test]
    fn reply_not_for_gateway_is_ignored() {
        let mut state = state();
        let dp = RecordingDatapath::new();
        let mut reply = reply_from(HOST_IP, HOST_MAC);
        reply.target_ip = Ipv4Addr::new(10, 0, 1, 2);

        assert_eq!(handle_arp_reply(&mut state, &dp, 1, &reply).unwrap(), 0);
        assert!(state.arp.is_empty());
    }

    #[test]
    fn cached_host_is_delivered_directly() {
        let mut state = state();
        let dp = RecordingDatapath::new();
        state.arp.insert(HOST_IP, HOST_MAC);

        assert!(handle_ipv4(&mut state, &dp, HOST_IP, &data_frame(HOST_IP, b"hi")).unwrap());
        let events = dp.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DatapathEvent::Install(rule) if rule.matches.nw_dst.prefix_len() == 32));
        assert!(matches!(&events[1], DatapathEvent::Frame { port_no: 1, .. }));
    }

    #[test]
    fn broadcast_and_foreign_destinations_are_dropped() {
        let mut state = state();
        let dp = RecordingDatapath::new();

        assert!(!handle_ipv4(&mut state, &dp, Ipv4Addr::BROADCAST, &data_frame(Ipv4Addr::BROADCAST, b"b")).unwrap());
        let foreign = Ipv4Addr::new(192, 168, 0, 1);
        assert!(!handle_ipv4(&mut state, &dp, foreign, &data_frame(foreign, b"f")).unwrap());
        assert!(dp.events().is_empty());
        assert!(state.pending.is_empty());
    }

    #[test]
    fn packet_in_dispatches_by_frame_type() {
        let mut state = state();
        let dp = RecordingDatapath::new();
        let request = packet::arp_request(HOST_MAC, HOST_IP, GW_IP);

        handle_packet_in(&mut state, &dp, 1, &request).unwrap();
        assert_eq!(dp.frames().len(), 1);
        assert!(handle_packet_in(&mut state, &dp, 1, &[0u8; 4]).is_err());
    }
}
