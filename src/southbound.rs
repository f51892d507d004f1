//! Seam towards the switches: rule installation and raw frame output.
//!
//! The wire protocol spoken to real switches lives behind [`Datapath`];
//! this crate only decides *what* to program.

use log::info;
use serde::{Serialize, Serializer};
use std::sync::Mutex;

use crate::error::{Result, RouterError};
use crate::types::{MacAddr, PortNo, Subnet, SwitchId, dpid_to_str};

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const IP_PROTO_ICMP: u8 = 1;
pub const DEFAULT_PRIORITY: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowMatch {
    pub dl_type: u16,
    pub nw_dst: Subnet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nw_proto: Option<u8>,
}

impl FlowMatch {
    pub fn ipv4_dst(nw_dst: Subnet, nw_proto: Option<u8>) -> Self {
        Self {
            dl_type: ETH_TYPE_IP,
            nw_dst,
            nw_proto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum FlowAction {
    SetDlSrc(#[serde(serialize_with = "mac_string")] MacAddr),
    SetDlDst(#[serde(serialize_with = "mac_string")] MacAddr),
    Output(PortNo),
}

fn mac_string<S: Serializer>(mac: &MacAddr, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(mac)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRule {
    #[serde(rename = "match")]
    pub matches: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub priority: u16,
}

impl FlowRule {
    /// Rewrite both MAC addresses and send out `out_port`.
    pub fn rewrite_and_output(matches: FlowMatch, src: MacAddr, dst: MacAddr, out_port: PortNo, priority: u16) -> Self {
        Self {
            matches,
            actions: vec![
                FlowAction::SetDlSrc(src),
                FlowAction::SetDlDst(dst),
                FlowAction::Output(out_port),
            ],
            priority,
        }
    }
}

/// Southbound capabilities of one switch.
pub trait Datapath: Send + Sync {
    /// Adds the rule, replacing any rule with the same match.
    fn install_flow(&self, rule: &FlowRule) -> Result<()>;

    fn remove_flow(&self, matches: &FlowMatch) -> Result<()>;

    fn send_frame(&self, port_no: PortNo, frame: &[u8]) -> Result<()>;
}

/// Datapath that only logs what would be sent.
pub struct LoggingDatapath {
    switch: SwitchId,
}

impl LoggingDatapath {
    pub fn new(switch: SwitchId) -> Self {
        Self { switch }
    }
}

impl Datapath for LoggingDatapath {
    fn install_flow(&self, rule: &FlowRule) -> Result<()> {
        info!(
            "FlowMod add nw_dst={} priority={} actions={:?} (dpid={})",
            rule.matches.nw_dst,
            rule.priority,
            rule.actions,
            dpid_to_str(self.switch)
        );
        Ok(())
    }

    fn remove_flow(&self, matches: &FlowMatch) -> Result<()> {
        info!("FlowMod delete nw_dst={} (dpid={})", matches.nw_dst, dpid_to_str(self.switch));
        Ok(())
    }

    fn send_frame(&self, port_no: PortNo, frame: &[u8]) -> Result<()> {
        info!(
            "PacketOut {} bytes on port {} (dpid={})",
            frame.len(),
            port_no,
            dpid_to_str(self.switch)
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapathEvent {
    Install(FlowRule),
    Remove(FlowMatch),
    Frame { port_no: PortNo, frame: Vec<u8> },
}

/// Datapath that keeps every call in memory, for inspection.
#[derive(Default)]
pub struct RecordingDatapath {
    events: Mutex<Vec<DatapathEvent>>,
}

impl RecordingDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DatapathEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn installed(&self) -> Vec<FlowRule> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DatapathEvent::Install(rule) => Some(rule),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<FlowMatch> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DatapathEvent::Remove(matches) => Some(matches),
                _ => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<(PortNo, Vec<u8>)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DatapathEvent::Frame { port_no, frame } => Some((port_no, frame)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn record(&self, event: DatapathEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| RouterError::Datapath("recorder poisoned".into()))?
            .push(event);
        Ok(())
    }
}

impl Datapath for RecordingDatapath {
    fn install_flow(&self, rule: &FlowRule) -> Result<()> {
        self.record(DatapathEvent::Install(rule.clone()))
    }

    fn remove_flow(&self, matches: &FlowMatch) -> Result<()> {
        self.record(DatapathEvent::Remove(*matches))
    }

    fn send_frame(&self, port_no: PortNo, frame: &[u8]) -> Result<()> {
        self.record(DatapathEvent::Frame {
            port_no,
            frame: frame.to_vec(),
        })
    }
}
