use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::southbound::FlowRule;
use crate::types::{MacAddr, PortNo, Subnet, SwitchId};

pub const METRIC_LOCAL: u8 = 0;
pub const METRIC_UNREACHABLE: u8 = 16;

pub const TIMER_BASE_MIN: u64 = 25;
pub const TIMER_BASE_MAX: u64 = 35;

/// Floor for the advertise interval; tokio intervals reject a zero period.
pub const MIN_ADVERTISE_INTERVAL: Duration = Duration::from_secs(1);

/// Per-node protocol timers. Only the advertise interval is chosen; the
/// other two are fixed multiples of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub advertise_interval: Duration,
    pub expire_time: Duration,
    pub gc_interval: Duration,
}

impl TimerConfig {
    pub fn from_advertise_interval(advertise_interval: Duration) -> Self {
        let advertise_interval = advertise_interval.max(MIN_ADVERTISE_INTERVAL);
        Self {
            advertise_interval,
            expire_time: advertise_interval * 3,
            gc_interval: advertise_interval * 2,
        }
    }

    /// Draws the advertise interval uniformly from `min_secs..=max_secs`,
    /// never below one second.
    pub fn randomized<R: Rng + ?Sized>(rng: &mut R, min_secs: u64, max_secs: u64) -> Self {
        let (lo, hi) = if min_secs <= max_secs { (min_secs, max_secs) } else { (max_secs, min_secs) };
        let (lo, hi) = (lo.max(1), hi.max(1));
        Self::from_advertise_interval(Duration::from_secs(rng.gen_range(lo..=hi)))
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self::randomized(&mut rand::thread_rng(), TIMER_BASE_MIN, TIMER_BASE_MAX)
    }
}

/// The neighbor interface a learned route points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    pub switch: SwitchId,
    pub port_no: PortNo,
    pub hw_addr: MacAddr,
}

#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub local_interface: PortNo,
    pub next_hop: Option<NextHop>,
    pub metric: u8,
    pub last_update: Instant,
    /// Rule most recently installed for this entry.
    pub flow_entry: Option<FlowRule>,
}

impl RoutingEntry {
    fn new(local_interface: PortNo, next_hop: Option<NextHop>, metric: u8, now: Instant) -> Self {
        Self {
            local_interface,
            next_hop,
            metric,
            last_update: now,
            flow_entry: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.metric == METRIC_LOCAL
    }

    pub fn is_reachable(&self) -> bool {
        self.metric < METRIC_UNREACHABLE
    }
}

/// One row of an advertisement: what a neighbor claims about a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedRoute {
    pub subnet: Subnet,
    pub metric: u8,
}

/// Summary of what one merge pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub poisoned: usize,
    pub inserted: usize,
    pub improved: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.poisoned + self.inserted + self.improved > 0
    }
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: BTreeMap<Subnet, RoutingEntry>,
    timers: TimerConfig,
    refresh_on_readvertise: bool,
}

impl RoutingTable {
    pub fn new(timers: TimerConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            timers,
            refresh_on_readvertise: false,
        }
    }

    /// Refresh `last_update` when the current next hop re-advertises a
    /// route without improving it. Off by default, so a route that keeps
    /// being re-heard at the same metric still ages out after
    /// `expire_time` and is only re-learned on the following merge.
    pub fn with_refresh_on_readvertise(mut self, enabled: bool) -> Self {
        self.refresh_on_readvertise = enabled;
        self
    }

    pub fn timers(&self) -> &TimerConfig {
        &self.timers
    }

    pub fn advertise_interval(&self) -> Duration {
        self.timers.advertise_interval
    }

    pub fn expire_time(&self) -> Duration {
        self.timers.expire_time
    }

    pub fn gc_interval(&self) -> Duration {
        self.timers.gc_interval
    }

    pub fn get(&self, subnet: &Subnet) -> Option<&RoutingEntry> {
        self.entries.get(subnet)
    }

    pub(crate) fn get_mut(&mut self, subnet: &Subnet) -> Option<&mut RoutingEntry> {
        self.entries.get_mut(subnet)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Subnet, &RoutingEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_local(&mut self, subnet: Subnet, local_interface: PortNo) {
        self.set_local_at(subnet, local_interface, Instant::now());
    }

    pub fn set_local_at(&mut self, subnet: Subnet, local_interface: PortNo, now: Instant) {
        info!("local subnet {} bound to port {}", subnet, local_interface);
        self.entries
            .insert(subnet, RoutingEntry::new(local_interface, None, METRIC_LOCAL, now));
    }

    /// Drops a directly attached subnet whose gateway binding was replaced.
    /// Learned entries are left alone.
    pub fn remove_local(&mut self, subnet: &Subnet) -> bool {
        if self.entries.get(subnet).is_some_and(RoutingEntry::is_local) {
            self.entries.remove(subnet);
            true
        } else {
            false
        }
    }

    pub fn merge(&mut self, local_interface: PortNo, next_hop: NextHop, advertised: &[AdvertisedRoute]) -> MergeOutcome {
        self.merge_at(local_interface, next_hop, advertised, Instant::now())
    }

    pub fn merge_at(
        &mut self,
        local_interface: PortNo,
        next_hop: NextHop,
        advertised: &[AdvertisedRoute],
        now: Instant,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome {
            poisoned: self.expire_at(now),
            ..Default::default()
        };

        for route in advertised {
            let candidate = route.metric.saturating_add(1).min(METRIC_UNREACHABLE);

            match self.entries.get_mut(&route.subnet) {
                None => {
                    debug!("learned {} metric {} via port {}", route.subnet, candidate, local_interface);
                    self.entries.insert(
                        route.subnet,
                        RoutingEntry::new(local_interface, Some(next_hop), candidate, now),
                    );
                    outcome.inserted += 1;
                }
                Some(entry) if entry.is_local() => {}
                Some(entry) if candidate < entry.metric => {
                    debug!(
                        "better route to {}: metric {} -> {} via port {}",
                        route.subnet, entry.metric, candidate, local_interface
                    );
                    entry.local_interface = local_interface;
                    entry.next_hop = Some(next_hop);
                    entry.metric = candidate;
                    entry.last_update = now;
                    outcome.improved += 1;
                }
                Some(entry) => {
                    if self.refresh_on_readvertise
                        && entry.is_reachable()
                        && entry.metric == candidate
                        && entry.next_hop == Some(next_hop)
                    {
                        entry.last_update = now;
                    }
                }
            }
        }

        outcome
    }

    /// Poisons every learned entry older than `expire_time`. Returns how
    /// many entries changed.
    pub fn expire_at(&mut self, now: Instant) -> usize {
        let expire_time = self.timers.expire_time;
        let mut poisoned = 0;

        for (subnet, entry) in self.entries.iter_mut() {
            if entry.is_local() || !entry.is_reachable() {
                continue;
            }
            if now.saturating_duration_since(entry.last_update) > expire_time {
                debug!("route to {} expired", subnet);
                entry.metric = METRIC_UNREACHABLE;
                poisoned += 1;
            }
        }

        poisoned
    }

    /// Removes every unreachable entry and hands the removed rows back so
    /// the caller can withdraw their forwarding rules.
    pub fn sweep_and_remove_unreachable(&mut self) -> Vec<(Subnet, RoutingEntry)> {
        let unreachable: Vec<Subnet> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_reachable())
            .map(|(subnet, _)| *subnet)
            .collect();

        unreachable
            .into_iter()
            .filter_map(|subnet| self.entries.remove(&subnet).map(|entry| (subnet, entry)))
            .collect()
    }

    /// Usable rows of this table, as pushed to neighbors.
    pub fn advertisement(&self) -> Vec<AdvertisedRoute> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_reachable())
            .map(|(subnet, entry)| AdvertisedRoute {
                subnet: *subnet,
                metric: entry.metric,
            })
            .collect()
    }
}
