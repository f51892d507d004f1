//! Switch registry and the operations exposed to topology discovery, the
//! packet-in path and the control server.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::{RouterConfig, TopologyConfig};
use crate::error::{Result, RouterError};
use crate::gateway::Gateway;
use crate::port::{Neighbor, Port, PortView};
use crate::protocol::messages::{Mailboxes, new_mailboxes};
use crate::protocol::routing_table::{RoutingEntry, TimerConfig};
use crate::protocol::{NodeOptions, Switch, SwitchState, message_handler};
use crate::resolver::ArpEntryView;
use crate::southbound::{Datapath, FlowRule};
use crate::types::{MacAddr, PortNo, Subnet, SwitchId, dpid_to_str, port_no_to_str};

/// Description of a switch port as reported by the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: PortNo,
    pub hw_addr: MacAddr,
    pub name: String,
}

/// One side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEnd {
    pub switch: SwitchId,
    pub port: PortDesc,
}

/// Notifications from the topology collaborator.
pub enum TopologyEvent {
    SwitchEnter {
        id: SwitchId,
        name: String,
        datapath: Arc<dyn Datapath>,
    },
    SwitchLeave {
        id: SwitchId,
    },
    PortAdd {
        switch: SwitchId,
        port: PortDesc,
    },
    PortDelete {
        switch: SwitchId,
        port_no: PortNo,
    },
    LinkAdd {
        src: LinkEnd,
        dst: LinkEnd,
    },
    LinkDelete {
        src: LinkEnd,
        dst: LinkEnd,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteView {
    pub subnet: String,
    pub out_port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
    pub metric: u8,
    pub last_update: String,
    pub flow_entry: Option<FlowRule>,
}

impl RouteView {
    fn new(subnet: &Subnet, entry: &RoutingEntry, now: Instant, wall: DateTime<Utc>) -> Self {
        let age = chrono::Duration::from_std(now.saturating_duration_since(entry.last_update))
            .unwrap_or_else(|_| chrono::Duration::zero());

        Self {
            subnet: subnet.to_string(),
            out_port: port_no_to_str(entry.local_interface),
            next_hop: if entry.is_local() {
                None
            } else {
                entry.next_hop.map(|hop| dpid_to_str(hop.switch))
            },
            metric: entry.metric,
            last_update: (wall - age).format("%Y-%m-%d %H:%M:%S").to_string(),
            flow_entry: entry.flow_entry.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchView {
    pub dpid: String,
    pub name: String,
    pub neighbors: Vec<String>,
    pub ports: Vec<PortView>,
    pub arp_table: Vec<ArpEntryView>,
    pub routing_table: Vec<RouteView>,
}

fn port_views(state: &SwitchState) -> Vec<PortView> {
    state.ports.values().map(Port::to_view).collect()
}

fn route_views(state: &SwitchState) -> Vec<RouteView> {
    let now = Instant::now();
    let wall = Utc::now();
    state
        .table
        .iter()
        .map(|(subnet, entry)| RouteView::new(subnet, entry, now, wall))
        .collect()
}

fn switch_view(state: &SwitchState) -> SwitchView {
    SwitchView {
        dpid: dpid_to_str(state.id),
        name: state.name.clone(),
        neighbors: state.neighbors().into_iter().map(dpid_to_str).collect(),
        ports: port_views(state),
        arp_table: state.arp.to_view(),
        routing_table: route_views(state),
    }
}

pub struct Controller {
    options: NodeOptions,
    switches: RwLock<BTreeMap<SwitchId, Arc<Switch>>>,
    mailboxes: Mailboxes,
}

impl Controller {
    pub fn new(options: NodeOptions) -> Self {
        Self {
            options,
            switches: RwLock::new(BTreeMap::new()),
            mailboxes: new_mailboxes(),
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(config.node_options())
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    pub async fn switch(&self, id: SwitchId) -> Result<Arc<Switch>> {
        self.switches
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RouterError::SwitchNotFound(id))
    }

    pub async fn handle_topology_event(&self, event: TopologyEvent) {
        match event {
            TopologyEvent::SwitchEnter { id, name, datapath } => {
                self.add_switch(id, name, datapath).await;
            }
            TopologyEvent::SwitchLeave { id } => self.remove_switch(id).await,
            TopologyEvent::PortAdd { switch, port } => self.add_port(switch, port).await,
            TopologyEvent::PortDelete { switch, port_no } => self.delete_port(switch, port_no).await,
            TopologyEvent::LinkAdd { src, dst } => self.add_link(src, dst).await,
            TopologyEvent::LinkDelete { src, dst } => self.delete_link(src, dst).await,
        }
    }

    /// Creates and starts a node unless one already exists for `id`.
    pub async fn add_switch(&self, id: SwitchId, name: String, datapath: Arc<dyn Datapath>) -> Arc<Switch> {
        let timers = self.options.timers();
        self.add_switch_with_timers(id, name, datapath, timers).await
    }

    pub async fn add_switch_with_timers(
        &self,
        id: SwitchId,
        name: String,
        datapath: Arc<dyn Datapath>,
        timers: TimerConfig,
    ) -> Arc<Switch> {
        let mut switches = self.switches.write().await;
        if let Some(existing) = switches.get(&id) {
            debug!("switch {} already registered", dpid_to_str(id));
            return existing.clone();
        }

        let switch = Arc::new(
            Switch::start_with_timers(id, name, datapath, &self.options, timers, self.mailboxes.clone()).await,
        );
        self.mailboxes.write().await.insert(id, switch.inbox());
        switches.insert(id, switch.clone());
        info!("switch entered: {}", dpid_to_str(id));
        switch
    }

    pub async fn remove_switch(&self, id: SwitchId) {
        let Some(switch) = self.switches.write().await.remove(&id) else {
            return;
        };
        self.mailboxes.write().await.remove(&id);
        switch.shutdown().await;

        // Links towards the departed switch are gone as well.
        for other in self.switches.read().await.values() {
            let mut state = other.state().lock().await;
            for port in state.ports.values_mut() {
                if port.neighbor.is_some_and(|n| n.switch == id) {
                    port.neighbor = None;
                }
            }
        }
        info!("switch left: {}", dpid_to_str(id));
    }

    pub async fn add_port(&self, switch: SwitchId, desc: PortDesc) {
        let Ok(switch) = self.switch(switch).await else {
            return;
        };
        let mut state = switch.state().lock().await;
        let id = state.id;
        state
            .ports
            .entry(desc.port_no)
            .or_insert_with(|| Port::new(id, desc.port_no, desc.hw_addr, desc.name));
    }

    pub async fn delete_port(&self, switch: SwitchId, port_no: PortNo) {
        let Ok(switch) = self.switch(switch).await else {
            return;
        };
        let mut state = switch.state().lock().await;
        if let Some(port) = state.ports.remove(&port_no) {
            if let Some(gateway) = &port.gateway {
                state.table.remove_local(&gateway.ipv4_subnet);
            }
        }
    }

    /// Records a bidirectional link.
    pub async fn add_link(&self, src: LinkEnd, dst: LinkEnd) {
        self.set_link_end(&src, Some(Neighbor { switch: dst.switch, port_no: dst.port.port_no }))
            .await;
        self.set_link_end(&dst, Some(Neighbor { switch: src.switch, port_no: src.port.port_no }))
            .await;
        info!("link connected: {}->{}", dpid_to_str(src.switch), dpid_to_str(dst.switch));
    }

    pub async fn delete_link(&self, src: LinkEnd, dst: LinkEnd) {
        self.set_link_end(&src, None).await;
        self.set_link_end(&dst, None).await;
        info!("link disconnected: {}->{}", dpid_to_str(src.switch), dpid_to_str(dst.switch));
    }

    async fn set_link_end(&self, end: &LinkEnd, neighbor: Option<Neighbor>) {
        let Ok(switch) = self.switch(end.switch).await else {
            debug!("link end on unknown switch {}", dpid_to_str(end.switch));
            return;
        };
        let mut state = switch.state().lock().await;
        let id = state.id;

        if let Some(port) = state.ports.get_mut(&end.port.port_no) {
            port.neighbor = neighbor;
        } else if let Some(neighbor) = neighbor {
            let mut port = Port::new(id, end.port.port_no, end.port.hw_addr, end.port.name.clone());
            port.neighbor = Some(neighbor);
            state.ports.insert(end.port.port_no, port);
        }
    }

    pub async fn list_switches(&self) -> Vec<SwitchId> {
        self.switches.read().await.keys().copied().collect()
    }

    pub async fn list_ports(&self, id: SwitchId) -> Result<Vec<Port>> {
        let switch = self.switch(id).await?;
        let state = switch.state().lock().await;
        Ok(state.ports.values().cloned().collect())
    }

    pub async fn neighbor_of(&self, id: SwitchId, port_no: PortNo) -> Result<Option<Neighbor>> {
        let switch = self.switch(id).await?;
        let state = switch.state().lock().await;
        Ok(state.port(port_no)?.neighbor)
    }

    pub async fn packet_in(&self, id: SwitchId, in_port: PortNo, frame: &[u8]) -> Result<()> {
        let switch = self.switch(id).await?;
        switch.packet_in(in_port, frame).await
    }

    pub async fn switch_views(&self) -> Vec<SwitchView> {
        let switches: Vec<Arc<Switch>> = self.switches.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(switches.len());
        for switch in switches {
            views.push(switch_view(&*switch.state().lock().await));
        }
        views
    }

    pub async fn switch_view(&self, id: SwitchId) -> Result<SwitchView> {
        let switch = self.switch(id).await?;
        let state = switch.state().lock().await;
        Ok(switch_view(&state))
    }

    pub async fn arp_table(&self, id: SwitchId) -> Result<Vec<ArpEntryView>> {
        let switch = self.switch(id).await?;
        let state = switch.state().lock().await;
        Ok(state.arp.to_view())
    }

    /// Operator-supplied binding. Packets waiting on `ip` are released.
    pub async fn put_arp(&self, id: SwitchId, ip: Ipv4Addr, hw_addr: MacAddr) -> Result<()> {
        let switch = self.switch(id).await?;
        let mut state = switch.state().lock().await;
        state.arp.insert(ip, hw_addr);
        message_handler::replay_pending(&mut state, switch.datapath().as_ref());
        Ok(())
    }

    pub async fn port_views(&self, id: SwitchId) -> Result<Vec<PortView>> {
        let switch = self.switch(id).await?;
        let state = switch.state().lock().await;
        Ok(port_views(&state))
    }

    pub async fn routing_table(&self, id: SwitchId) -> Result<Vec<RouteView>> {
        let switch = self.switch(id).await?;
        let state = switch.state().lock().await;
        Ok(route_views(&state))
    }

    pub async fn set_gateway(
        &self,
        id: SwitchId,
        port_no: PortNo,
        ipv4: Ipv4Addr,
        ipv4_prefixlen: u8,
        ipv6: Ipv6Addr,
        ipv6_prefixlen: u8,
    ) -> Result<()> {
        let switch = self.switch(id).await?;
        let mut state = switch.state().lock().await;
        let name = state.port(port_no)?.name.clone();
        let gateway = Gateway::new(name, port_no, ipv4, ipv4_prefixlen, ipv6, ipv6_prefixlen)?;
        state.set_gateway(gateway)
    }

    /// Feeds a static topology through the same paths discovery would use.
    pub async fn apply_topology<F>(&self, topology: &TopologyConfig, mut datapath_for: F) -> anyhow::Result<()>
    where
        F: FnMut(SwitchId) -> Arc<dyn Datapath>,
    {
        let mut descs: BTreeMap<(SwitchId, PortNo), PortDesc> = BTreeMap::new();

        for sw in &topology.switches {
            let name = if sw.name.is_empty() { dpid_to_str(sw.dpid) } else { sw.name.clone() };
            self.add_switch(sw.dpid, name, datapath_for(sw.dpid)).await;

            for port in &sw.ports {
                let hw_addr: MacAddr = port
                    .hw_addr
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid hw_addr {:?} on switch {}", port.hw_addr, sw.dpid))?;
                let desc = PortDesc {
                    port_no: port.port_no,
                    hw_addr,
                    name: port.name.clone(),
                };
                descs.insert((sw.dpid, port.port_no), desc.clone());
                self.add_port(sw.dpid, desc).await;

                if let Some(gw) = &port.gateway {
                    self.set_gateway(sw.dpid, port.port_no, gw.ipv4, gw.ipv4_prefixlen, gw.ipv6, gw.ipv6_prefixlen)
                        .await?;
                }
            }
        }

        for link in &topology.links {
            let end = |dpid: SwitchId, port_no: PortNo| -> anyhow::Result<LinkEnd> {
                let port = descs
                    .get(&(dpid, port_no))
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("link refers to unknown port {}:{}", dpid, port_no))?;
                Ok(LinkEnd { switch: dpid, port })
            };
            let src = end(link.src.dpid, link.src.port_no)?;
            let dst = end(link.dst.dpid, link.dst.port_no)?;
            self.add_link(src, dst).await;
        }

        if topology.switches.is_empty() {
            warn!("no switches configured");
        }
        Ok(())
    }

    /// Stops every node.
    pub async fn shutdown(&self) {
        let switches: Vec<SwitchId> = self.list_switches().await;
        for id in switches {
            self.remove_switch(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::southbound::RecordingDatapath;
    use std::time::Duration;

    fn desc(port_no: PortNo, switch: u8) -> PortDesc {
        PortDesc {
            port_no,
            hw_addr: MacAddr::new(0, 0, 0, 0, switch, port_no as u8),
            name: format!("s{}-eth{}", switch, port_no),
        }
    }

    async fn controller_with(ids: &[SwitchId]) -> Controller {
        let controller = Controller::new(NodeOptions::default());
        for &id in ids {
            controller
                .add_switch_with_timers(
                    id,
                    format!("s{}", id),
                    Arc::new(RecordingDatapath::new()),
                    TimerConfig::from_advertise_interval(Duration::from_secs(30)),
                )
                .await;
        }
        controller
    }

    #[tokio::test]
    async fn links_are_bidirectional() {
        let controller = controller_with(&[1, 2]).await;
        controller.add_port(1, desc(2, 1)).await;

        let src = LinkEnd { switch: 1, port: desc(2, 1) };
        let dst = LinkEnd { switch: 2, port: desc(3, 2) };
        controller.add_link(src.clone(), dst.clone()).await;

        assert_eq!(
            controller.neighbor_of(1, 2).await.unwrap(),
            Some(Neighbor { switch: 2, port_no: 3 })
        );
        // missing far-end port is created from the link description
        assert_eq!(
            controller.neighbor_of(2, 3).await.unwrap(),
            Some(Neighbor { switch: 1, port_no: 2 })
        );

        controller.delete_link(src, dst).await;
        assert_eq!(controller.neighbor_of(1, 2).await.unwrap(), None);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let controller = controller_with(&[1]).await;
        assert!(matches!(controller.switch_view(7).await, Err(RouterError::SwitchNotFound(7))));
        assert!(matches!(controller.neighbor_of(1, 9).await, Err(RouterError::PortNotFound(1, 9))));
        let err = controller
            .set_gateway(1, 9, Ipv4Addr::new(10, 0, 1, 1), 24, Ipv6Addr::UNSPECIFIED, 0)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn switch_leave_stops_node_and_clears_links() {
        let controller = controller_with(&[1, 2]).await;
        controller
            .add_link(LinkEnd { switch: 1, port: desc(2, 1) }, LinkEnd { switch: 2, port: desc(2, 2) })
            .await;

        controller.handle_topology_event(TopologyEvent::SwitchLeave { id: 2 }).await;
        assert_eq!(controller.list_switches().await, vec![1]);
        assert!(!controller.mailboxes().read().await.contains_key(&2));
        assert_eq!(controller.neighbor_of(1, 2).await.unwrap(), None);

        // unknown id is a no-op
        controller.handle_topology_event(TopologyEvent::SwitchLeave { id: 2 }).await;
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn static_topology_builds_switches_gateways_and_links() {
        let config: RouterConfig = serde_json::from_str(
            r#"{"topology": {
                "switches": [
                    {"dpid": 1, "ports": [
                        {"port_no": 1, "hw_addr": "00:00:00:00:01:01", "name": "s1-eth1",
                         "gateway": {"ipv4": "10.0.1.1", "ipv4_prefixlen": 24}},
                        {"port_no": 2, "hw_addr": "00:00:00:00:01:02"}
                    ]},
                    {"dpid": 2, "name": "edge", "ports": [
                        {"port_no": 1, "hw_addr": "00:00:00:00:02:01"}
                    ]}
                ],
                "links": [{"src": {"dpid": 1, "port_no": 2}, "dst": {"dpid": 2, "port_no": 1}}]
            }}"#,
        )
        .unwrap();

        let controller = Controller::from_config(&config);
        controller
            .apply_topology(&config.topology, |_| Arc::new(RecordingDatapath::new()) as Arc<dyn Datapath>)
            .await
            .unwrap();

        assert_eq!(controller.list_switches().await, vec![1, 2]);
        assert_eq!(
            controller.neighbor_of(2, 1).await.unwrap(),
            Some(Neighbor { switch: 1, port_no: 2 })
        );
        let view = controller.switch_view(1).await.unwrap();
        assert_eq!(view.name, "0000000000000001");
        assert_eq!(view.neighbors, vec!["0000000000000002".to_string()]);
        assert_eq!(view.routing_table[0].subnet, "10.0.1.0/24");
        assert_eq!(controller.switch_view(2).await.unwrap().name, "edge");

        let mut broken = config.topology.clone();
        broken.links[0].dst.port_no = 9;
        assert!(controller.apply_topology(&broken, |_| Arc::new(RecordingDatapath::new()) as Arc<dyn Datapath>).await.is_err());
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timer_range_still_runs_protocol_tasks() {
        let config: RouterConfig = serde_json::from_str(r#"{"timer_base_min": 0, "timer_base_max": 0}"#).unwrap();
        let controller = Controller::from_config(&config);
        for id in [1, 2] {
            controller
                .add_switch(id, format!("s{}", id), Arc::new(RecordingDatapath::new()))
                .await;
        }
        controller.add_port(2, desc(1, 2)).await;
        controller
            .set_gateway(2, 1, Ipv4Addr::new(10, 0, 2, 1), 24, Ipv6Addr::UNSPECIFIED, 0)
            .await
            .unwrap();
        controller
            .add_link(LinkEnd { switch: 1, port: desc(2, 1) }, LinkEnd { switch: 2, port: desc(3, 2) })
            .await;

        // one-second advertise period: learned well before the 3s expiry
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let routes = controller.routing_table(1).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].subnet, "10.0.2.0/24");
        assert_eq!(routes[0].metric, 1);

        let switch = controller.switch(1).await.unwrap();
        assert!(switch.get_task_handles().lock().await.iter().all(|handle| !handle.is_finished()));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn route_view_hides_next_hop_of_local_rows() {
        let controller = controller_with(&[1]).await;
        controller.add_port(1, desc(1, 1)).await;
        controller
            .set_gateway(1, 1, Ipv4Addr::new(10, 0, 1, 1), 24, Ipv6Addr::UNSPECIFIED, 0)
            .await
            .unwrap();

        let json = serde_json::to_value(controller.routing_table(1).await.unwrap()).unwrap();
        assert_eq!(json[0]["subnet"], "10.0.1.0/24");
        assert_eq!(json[0]["out_port"], "00000001");
        assert_eq!(json[0]["metric"], 0);
        assert!(json[0].get("next_hop").is_none());
        assert!(json[0]["flow_entry"].is_null());
        controller.shutdown().await;
    }
}
