use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Result, RouterError};
use crate::types::{PortNo, Subnet};

/// Static address binding of a port. The IPv4 subnet is the directly
/// attached network announced with metric 0; the IPv6 fields are metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub ipv4_subnet: Subnet,
    pub ipv6: Ipv6Addr,
    pub ipv6_subnet: Ipv6Net,
    pub port_no: PortNo,
}

impl Gateway {
    pub fn new(
        name: String,
        port_no: PortNo,
        ipv4: Ipv4Addr,
        ipv4_prefixlen: u8,
        ipv6: Ipv6Addr,
        ipv6_prefixlen: u8,
    ) -> Result<Self> {
        let ipv4_subnet = Ipv4Net::new(ipv4, ipv4_prefixlen)
            .map_err(|_| RouterError::BadRequest(format!("invalid ipv4 prefix length {}", ipv4_prefixlen)))?
            .trunc();
        let ipv6_subnet = Ipv6Net::new(ipv6, ipv6_prefixlen)
            .map_err(|_| RouterError::BadRequest(format!("invalid ipv6 prefix length {}", ipv6_prefixlen)))?
            .trunc();

        Ok(Self {
            name,
            ipv4,
            ipv4_subnet,
            ipv6,
            ipv6_subnet,
            port_no,
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.ipv4_subnet.contains(&addr)
    }

    pub fn to_view(&self) -> GatewayView {
        GatewayView {
            ipv4: self.ipv4.to_string(),
            ipv4_netmask: self.ipv4_subnet.netmask().to_string(),
            ipv6: self.ipv6.to_string(),
            ipv6_netmask: self.ipv6_subnet.netmask().to_string(),
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Gateway<name={}, ipv4={}, ipv6={}, port_no={}>",
            self.name, self.ipv4, self.ipv6, self.port_no
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayView {
    pub ipv4: String,
    pub ipv4_netmask: String,
    pub ipv6: String,
    pub ipv6_netmask: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_is_normalized_and_masks_are_rendered() {
        let gw = Gateway::new(
            "s1-eth1".into(),
            1,
            Ipv4Addr::new(10, 0, 1, 1),
            24,
            "fd00::1".parse().unwrap(),
            64,
        )
        .unwrap();

        assert_eq!(gw.ipv4_subnet.to_string(), "10.0.1.0/24");
        assert!(gw.contains(Ipv4Addr::new(10, 0, 1, 50)));
        assert!(!gw.contains(Ipv4Addr::new(10, 0, 2, 50)));

        let view = gw.to_view();
        assert_eq!(view.ipv4, "10.0.1.1");
        assert_eq!(view.ipv4_netmask, "255.255.255.0");
        assert_eq!(view.ipv6_netmask, "ffff:ffff:ffff:ffff::");
    }

    #[test]
    fn rejects_out_of_range_prefix() {
        let err = Gateway::new("p".into(), 1, Ipv4Addr::new(10, 0, 0, 1), 40, Ipv6Addr::UNSPECIFIED, 0);
        assert!(matches!(err, Err(RouterError::BadRequest(_))));
    }
}
