use log::{debug, warn};

use super::SwitchState;
use super::routing_table::RoutingEntry;
use crate::southbound::{Datapath, FlowRule};
use crate::types::{Subnet, dpid_to_str};

/// Installs a forwarding rule for every usable learned route whose rule
/// is missing or out of date. Returns how many rules were installed.
pub fn deploy_routing_table(state: &mut SwitchState, datapath: &dyn Datapath) -> usize {
    withdraw_poisoned(state, datapath);

    let mut plan: Vec<(Subnet, FlowRule)> = Vec::new();

    for (subnet, entry) in state.table.iter() {
        if entry.is_local() || !entry.is_reachable() {
            continue;
        }
        let Some(next_hop) = entry.next_hop else {
            continue;
        };
        let Some(port) = state.ports.get(&entry.local_interface) else {
            warn!(
                "no local port {} for route to {}, skipping (dpid={})",
                entry.local_interface,
                subnet,
                dpid_to_str(state.id)
            );
            continue;
        };

        let rule = FlowRule::rewrite_and_output(
            state.flow_match(*subnet),
            port.hw_addr,
            next_hop.hw_addr,
            port.port_no,
            state.flow_priority,
        );
        if entry.flow_entry.as_ref() != Some(&rule) {
            plan.push((*subnet, rule));
        }
    }

    let mut installed = 0;
    for (subnet, rule) in plan {
        match datapath.install_flow(&rule) {
            Ok(()) => {
                debug!("route to {} deployed (dpid={})", subnet, dpid_to_str(state.id));
                if let Some(entry) = state.table.get_mut(&subnet) {
                    entry.flow_entry = Some(rule);
                }
                installed += 1;
            }
            Err(e) => warn!("failed to deploy route to {}: {} (dpid={})", subnet, e, dpid_to_str(state.id)),
        }
    }
    installed
}

/// Pulls the rules of entries poisoned since they were programmed, so
/// traffic stops following a dead next hop before garbage collection.
fn withdraw_poisoned(state: &mut SwitchState, datapath: &dyn Datapath) -> usize {
    let poisoned: Vec<(Subnet, FlowRule)> = state
        .table
        .iter()
        .filter(|(_, entry)| !entry.is_reachable())
        .filter_map(|(subnet, entry)| entry.flow_entry.clone().map(|rule| (*subnet, rule)))
        .collect();

    let mut withdrawn = 0;
    for (subnet, rule) in poisoned {
        match datapath.remove_flow(&rule.matches) {
            Ok(()) => {
                debug!("unreachable route to {} withdrawn (dpid={})", subnet, dpid_to_str(state.id));
                if let Some(entry) = state.table.get_mut(&subnet) {
                    entry.flow_entry = None;
                }
                withdrawn += 1;
            }
            Err(e) => warn!("failed to withdraw route to {}: {} (dpid={})", subnet, e, dpid_to_str(state.id)),
        }
    }
    withdrawn
}

/// Removes the datapath rules of routing entries that were dropped from
/// the table.
pub fn withdraw_routes(state: &SwitchState, datapath: &dyn Datapath, removed: &[(Subnet, RoutingEntry)]) -> usize {
    let mut withdrawn = 0;
    for (subnet, entry) in removed {
        let Some(rule) = &entry.flow_entry else {
            continue;
        };
        match datapath.remove_flow(&rule.matches) {
            Ok(()) => {
                debug!("route to {} withdrawn (dpid={})", subnet, dpid_to_str(state.id));
                withdrawn += 1;
            }
            Err(e) => warn!("failed to withdraw route to {}: {} (dpid={})", subnet, e, dpid_to_str(state.id)),
        }
    }
    withdrawn
}
