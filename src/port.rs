use serde::{Deserialize, Serialize};

use crate::gateway::{Gateway, GatewayView};
use crate::types::{MacAddr, PortNo, SwitchId, dpid_to_str, port_no_to_str};

/// Far end of a link, as reported by topology discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub switch: SwitchId,
    pub port_no: PortNo,
}

#[derive(Debug, Clone)]
pub struct Port {
    pub switch: SwitchId,
    pub port_no: PortNo,
    pub hw_addr: MacAddr,
    pub name: String,
    pub neighbor: Option<Neighbor>,
    pub gateway: Option<Gateway>,
}

impl Port {
    pub fn new(switch: SwitchId, port_no: PortNo, hw_addr: MacAddr, name: impl Into<String>) -> Self {
        Self {
            switch,
            port_no,
            hw_addr,
            name: name.into(),
            neighbor: None,
            gateway: None,
        }
    }

    pub fn to_view(&self) -> PortView {
        let (neighbor_switch_dpid, neighbor_port_no) = match self.neighbor {
            Some(n) => (dpid_to_str(n.switch), port_no_to_str(n.port_no)),
            None => (String::new(), String::new()),
        };

        PortView {
            port_no: port_no_to_str(self.port_no),
            hw_addr: self.hw_addr.to_string(),
            name: self.name.trim_end_matches('\0').to_string(),
            gateway: self.gateway.as_ref().map(Gateway::to_view),
            neighbor_switch_dpid,
            neighbor_port_no,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortView {
    pub port_no: String,
    pub hw_addr: String,
    pub name: String,
    /// Rendered as `{}` when the port has no gateway.
    #[serde(with = "empty_object")]
    pub gateway: Option<GatewayView>,
    pub neighbor_switch_dpid: String,
    pub neighbor_port_no: String,
}

mod empty_object {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::gateway::GatewayView;

    pub fn serialize<S: Serializer>(value: &Option<GatewayView>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(view) => view.serialize(serializer),
            None => serde_json::Map::new().serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<GatewayView>, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
            other => serde_json::from_value(other).map(Some).map_err(serde::de::Error::custom),
        }
    }
}
