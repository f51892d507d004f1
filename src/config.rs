use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::protocol::NodeOptions;
use crate::protocol::routing_table::{TIMER_BASE_MAX, TIMER_BASE_MIN};
use crate::resolver::{DEFAULT_ARP_CAPACITY, DEFAULT_PENDING_CAPACITY, DEFAULT_PENDING_TIMEOUT};
use crate::southbound::{DEFAULT_PRIORITY, IP_PROTO_ICMP};
use crate::types::{PortNo, SwitchId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub control_addr: String,
    pub timer_base_min: u64,    // seconds
    pub timer_base_max: u64,    // seconds
    pub inbox_capacity: usize,
    pub pending_capacity: usize,
    pub pending_timeout: u64,   // seconds
    pub arp_capacity: usize,
    pub refresh_on_readvertise: bool,
    pub match_ip_protocol: Option<u8>,
    pub flow_priority: u16,
    pub topology: TopologyConfig,
}

/// Switches, ports and links fed to the controller at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub switches: Vec<SwitchConfig>,
    pub links: Vec<LinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub dpid: SwitchId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub port_no: PortNo,
    pub hw_addr: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ipv4: Ipv4Addr,
    pub ipv4_prefixlen: u8,
    #[serde(default = "unspecified_v6")]
    pub ipv6: Ipv6Addr,
    #[serde(default)]
    pub ipv6_prefixlen: u8,
}

fn unspecified_v6() -> Ipv6Addr {
    Ipv6Addr::UNSPECIFIED
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub dpid: SwitchId,
    pub port_no: PortNo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkConfig {
    pub src: EndpointConfig,
    pub dst: EndpointConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            control_addr: "127.0.0.1:8080".to_string(),
            timer_base_min: TIMER_BASE_MIN,
            timer_base_max: TIMER_BASE_MAX,
            inbox_capacity: 32,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            pending_timeout: DEFAULT_PENDING_TIMEOUT.as_secs(),
            arp_capacity: DEFAULT_ARP_CAPACITY,
            refresh_on_readvertise: false,
            match_ip_protocol: Some(IP_PROTO_ICMP),
            flow_priority: DEFAULT_PRIORITY,
            topology: TopologyConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let config: RouterConfig =
            serde_json::from_str(&content).with_context(|| format!("parsing config {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.timer_base_min > 0, "timer_base_min must be positive");
        ensure!(
            self.timer_base_min <= self.timer_base_max,
            "timer_base_min ({}) exceeds timer_base_max ({})",
            self.timer_base_min,
            self.timer_base_max
        );
        ensure!(self.inbox_capacity > 0, "inbox_capacity must be positive");
        ensure!(self.pending_capacity > 0, "pending_capacity must be positive");
        ensure!(self.arp_capacity > 0, "arp_capacity must be positive");
        Ok(())
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            timer_base_min: self.timer_base_min,
            timer_base_max: self.timer_base_max,
            inbox_capacity: self.inbox_capacity,
            pending_capacity: self.pending_capacity,
            pending_timeout: Duration::from_secs(self.pending_timeout),
            arp_capacity: self.arp_capacity,
            refresh_on_readvertise: self.refresh_on_readvertise,
            match_ip_protocol: self.match_ip_protocol,
            flow_priority: self.flow_priority,
        }
    }
}
