use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

use super::routing_table::{AdvertisedRoute, NextHop};
use crate::types::{PortNo, SwitchId};

/// A node's usable routes, pushed to one directly connected neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Sending interface; becomes the next hop of every learned route.
    pub from: NextHop,
    /// Receiving interface on the neighbor.
    pub to_port: PortNo,
    pub routes: Vec<AdvertisedRoute>,
}

pub type Inbox = mpsc::Sender<Advertisement>;

/// Inbound advertisement queues of every live node, keyed by switch.
pub type Mailboxes = Arc<RwLock<HashMap<SwitchId, Inbox>>>;

pub fn new_mailboxes() -> Mailboxes {
    Arc::new(RwLock::new(HashMap::new()))
}
