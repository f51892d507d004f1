pub mod message_handler;
pub mod messages;
pub mod route_manager;
pub mod routing_table;
pub mod task_manager;

use log::{debug, info};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Result, RouterError};
use crate::gateway::Gateway;
use crate::port::Port;
use crate::resolver::{ArpCache, PendingBuffer};
use crate::southbound::{Datapath, FlowMatch};
use crate::types::{PortNo, Subnet, SwitchId, dpid_to_str};
use messages::{Advertisement, Inbox, Mailboxes};
use routing_table::{RoutingTable, TimerConfig};

/// Per-node tunables, usually derived from `RouterConfig`.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub timer_base_min: u64,
    pub timer_base_max: u64,
    pub inbox_capacity: usize,
    pub pending_capacity: usize,
    pub pending_timeout: Duration,
    pub arp_capacity: usize,
    pub refresh_on_readvertise: bool,
    pub match_ip_protocol: Option<u8>,
    pub flow_priority: u16,
}

impl Default for NodeOptions {
    fn default() -> Self {
        crate::config::RouterConfig::default().node_options()
    }
}

impl NodeOptions {
    pub fn timers(&self) -> TimerConfig {
        TimerConfig::randomized(&mut rand::thread_rng(), self.timer_base_min, self.timer_base_max)
    }
}

/// Everything one switch owns. Only ever touched under the node's lock.
#[derive(Debug)]
pub struct SwitchState {
    pub id: SwitchId,
    pub name: String,
    pub ports: BTreeMap<PortNo, Port>,
    pub table: RoutingTable,
    pub arp: ArpCache,
    pub pending: PendingBuffer,
    pub match_ip_protocol: Option<u8>,
    pub flow_priority: u16,
}

impl SwitchState {
    pub fn new(id: SwitchId, name: impl Into<String>, options: &NodeOptions, timers: TimerConfig) -> Self {
        Self {
            id,
            name: name.into(),
            ports: BTreeMap::new(),
            table: RoutingTable::new(timers).with_refresh_on_readvertise(options.refresh_on_readvertise),
            arp: ArpCache::new(options.arp_capacity),
            pending: PendingBuffer::new(options.pending_capacity, options.pending_timeout),
            match_ip_protocol: options.match_ip_protocol,
            flow_priority: options.flow_priority,
        }
    }

    pub fn port(&self, port_no: PortNo) -> Result<&Port> {
        self.ports
            .get(&port_no)
            .ok_or(RouterError::PortNotFound(self.id, port_no))
    }

    /// Distinct switches reachable over one link, in ascending order.
    pub fn neighbors(&self) -> Vec<SwitchId> {
        let mut ids: Vec<SwitchId> = self
            .ports
            .values()
            .filter_map(|port| port.neighbor.map(|n| n.switch))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Port whose gateway subnet contains `ip`.
    pub fn find_port_by_ip(&self, ip: Ipv4Addr) -> Option<&Port> {
        self.ports
            .values()
            .find(|port| port.gateway.as_ref().is_some_and(|gw| gw.contains(ip)))
    }

    /// Binds `gateway` to its port and asserts the directly attached
    /// subnet. A previous binding with a different subnet is withdrawn.
    pub fn set_gateway(&mut self, gateway: Gateway) -> Result<()> {
        let port_no = gateway.port_no;
        let id = self.id;
        let port = self
            .ports
            .get_mut(&port_no)
            .ok_or(RouterError::PortNotFound(id, port_no))?;

        if let Some(old) = port.gateway.take() {
            if old.ipv4_subnet != gateway.ipv4_subnet && self.table.remove_local(&old.ipv4_subnet) {
                debug!("withdrew local subnet {} (dpid={})", old.ipv4_subnet, dpid_to_str(id));
            }
        }

        let subnet = gateway.ipv4_subnet;
        info!("gateway {} set on port {} (dpid={})", gateway, port_no, dpid_to_str(id));
        port.gateway = Some(gateway);
        self.table.set_local(subnet, port_no);
        Ok(())
    }

    pub fn flow_match(&self, nw_dst: Subnet) -> FlowMatch {
        FlowMatch::ipv4_dst(nw_dst, self.match_ip_protocol)
    }
}

pub type SharedSwitchState = Arc<Mutex<SwitchState>>;

/// Handle to a running node: its state, southbound capability and the
/// background tasks that drive the protocol.
pub struct Switch {
    id: SwitchId,
    state: SharedSwitchState,
    datapath: Arc<dyn Datapath>,
    inbox: Inbox,
    shutdown_tx: broadcast::Sender<()>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Switch {
    /// Creates the node and starts its advertise, update and garbage
    /// collection tasks. Must be called inside a tokio runtime.
    pub async fn start(
        id: SwitchId,
        name: impl Into<String>,
        datapath: Arc<dyn Datapath>,
        options: &NodeOptions,
        mailboxes: Mailboxes,
    ) -> Self {
        Self::start_with_timers(id, name, datapath, options, options.timers(), mailboxes).await
    }

    pub async fn start_with_timers(
        id: SwitchId,
        name: impl Into<String>,
        datapath: Arc<dyn Datapath>,
        options: &NodeOptions,
        timers: TimerConfig,
        mailboxes: Mailboxes,
    ) -> Self {
        let state = Arc::new(Mutex::new(SwitchState::new(id, name, options, timers)));
        let (inbox, inbox_rx) = mpsc::channel::<Advertisement>(options.inbox_capacity.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let switch = Self {
            id,
            state,
            datapath,
            inbox,
            shutdown_tx,
            task_handles: Mutex::new(Vec::new()),
        };

        task_manager::start_tasks(&switch, inbox_rx, mailboxes).await;
        info!(
            "switch {} started (advertise every {:?})",
            dpid_to_str(id),
            timers.advertise_interval
        );
        switch
    }

    pub fn id(&self) -> SwitchId {
        self.id
    }

    pub fn state(&self) -> &SharedSwitchState {
        &self.state
    }

    pub fn datapath(&self) -> &Arc<dyn Datapath> {
        &self.datapath
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub(crate) fn get_shutdown_tx(&self) -> &broadcast::Sender<()> {
        &self.shutdown_tx
    }

    pub(crate) fn get_task_handles(&self) -> &Mutex<Vec<JoinHandle<()>>> {
        &self.task_handles
    }

    /// Handles a frame punted by the switch, under the node lock.
    pub async fn packet_in(&self, in_port: PortNo, data: &[u8]) -> Result<()> {
        let mut state_guard = self.state.lock().await;
        message_handler::handle_packet_in(&mut state_guard, self.datapath.as_ref(), in_port, data)
    }

    /// Stops every background task of this node and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                debug!("task of switch {} ended abnormally: {}", dpid_to_str(self.id), e);
            }
        }
        info!("switch {} stopped", dpid_to_str(self.id));
    }
}
