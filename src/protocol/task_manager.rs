use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, interval_at};

use super::messages::{Advertisement, Mailboxes};
use super::routing_table::{MergeOutcome, NextHop};
use super::{SharedSwitchState, Switch, route_manager};
use crate::southbound::Datapath;
use crate::types::{SwitchId, dpid_to_str};

pub async fn start_tasks(switch: &Switch, inbox_rx: mpsc::Receiver<Advertisement>, mailboxes: Mailboxes) {
    let mut handles_guard = switch.get_task_handles().lock().await;

    for handle in handles_guard.drain(..) {
        handle.abort();
    }

    let shutdown_tx = switch.get_shutdown_tx();

    let advertise_handle = start_advertise_task(switch, mailboxes, shutdown_tx.subscribe()).await;
    let update_handle = start_update_task(switch, inbox_rx, shutdown_tx.subscribe()).await;
    let gc_handle = start_gc_task(switch, shutdown_tx.subscribe()).await;

    handles_guard.push(advertise_handle);
    handles_guard.push(update_handle);
    handles_guard.push(gc_handle);

    debug!("protocol tasks started (dpid={})", dpid_to_str(switch.id()));
}

async fn start_advertise_task(
    switch: &Switch,
    mailboxes: Mailboxes,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let state = switch.state().clone();
    let id = switch.id();

    tokio::spawn(async move {
        advertise_task(id, state, mailboxes, &mut shutdown_rx).await;
    })
}

async fn start_update_task(
    switch: &Switch,
    inbox_rx: mpsc::Receiver<Advertisement>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let state = switch.state().clone();
    let datapath = switch.datapath().clone();
    let id = switch.id();

    tokio::spawn(async move {
        update_task(id, state, datapath, inbox_rx, &mut shutdown_rx).await;
    })
}

async fn start_gc_task(switch: &Switch, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
    let state = switch.state().clone();
    let datapath = switch.datapath().clone();
    let id = switch.id();

    tokio::spawn(async move {
        gc_task(id, state, datapath, &mut shutdown_rx).await;
    })
}

async fn advertise_task(
    id: SwitchId,
    state: SharedSwitchState,
    mailboxes: Mailboxes,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let period = state.lock().await.table.advertise_interval();
    let mut interval = interval(period);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Advertise task shutting down (dpid={})", dpid_to_str(id));
                break;
            }
            _ = interval.tick() => {
                send_advertisements(id, &state, &mailboxes).await;
            }
        }
    }
}

/// Pushes the usable part of the table to every linked neighbor. Never
/// waits on a neighbor: a full inbox drops the advertisement.
pub async fn send_advertisements(id: SwitchId, state: &SharedSwitchState, mailboxes: &Mailboxes) -> usize {
    let outgoing: Vec<(SwitchId, Advertisement)> = {
        let state_guard = state.lock().await;
        let routes = state_guard.table.advertisement();

        state_guard
            .ports
            .values()
            .filter_map(|port| {
                port.neighbor.map(|neighbor| {
                    let adv = Advertisement {
                        from: NextHop {
                            switch: id,
                            port_no: port.port_no,
                            hw_addr: port.hw_addr,
                        },
                        to_port: neighbor.port_no,
                        routes: routes.clone(),
                    };
                    (neighbor.switch, adv)
                })
            })
            .collect()
    };

    let mailboxes_guard = mailboxes.read().await;
    let mut sent = 0;

    for (target, adv) in outgoing {
        let Some(inbox) = mailboxes_guard.get(&target) else {
            debug!("no inbox for neighbor {}, skipped", dpid_to_str(target));
            continue;
        };
        let routes = adv.routes.len();
        match inbox.try_send(adv) {
            Ok(()) => {
                debug!(
                    "Sent {} routes from {} to {}",
                    routes,
                    dpid_to_str(id),
                    dpid_to_str(target)
                );
                sent += 1;
            }
            Err(TrySendError::Full(_)) => {
                warn!("inbox of {} is full, advertisement dropped", dpid_to_str(target));
            }
            Err(TrySendError::Closed(_)) => {
                debug!("neighbor {} is gone, advertisement dropped", dpid_to_str(target));
            }
        }
    }

    sent
}

async fn update_task(
    id: SwitchId,
    state: SharedSwitchState,
    datapath: Arc<dyn Datapath>,
    mut inbox_rx: mpsc::Receiver<Advertisement>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Update task shutting down (dpid={})", dpid_to_str(id));
                break;
            }
            received = inbox_rx.recv() => {
                let Some(first) = received else {
                    break;
                };
                let mut batch = vec![first];
                while let Ok(adv) = inbox_rx.try_recv() {
                    batch.push(adv);
                }
                process_advertisements(&state, datapath.as_ref(), batch).await;
            }
        }
    }
}

/// Merges a batch of advertisements and re-synthesizes forwarding rules,
/// all under one hold of the node lock.
pub async fn process_advertisements(
    state: &SharedSwitchState,
    datapath: &dyn Datapath,
    batch: Vec<Advertisement>,
) -> MergeOutcome {
    let mut state_guard = state.lock().await;
    let mut total = MergeOutcome::default();

    for adv in batch {
        if !state_guard.ports.contains_key(&adv.to_port) {
            debug!(
                "advertisement for unknown port {} ignored (dpid={})",
                adv.to_port,
                dpid_to_str(state_guard.id)
            );
            continue;
        }
        let outcome = state_guard.table.merge(adv.to_port, adv.from, &adv.routes);
        total.poisoned += outcome.poisoned;
        total.inserted += outcome.inserted;
        total.improved += outcome.improved;
    }

    if total.changed() {
        info!(
            "routing table updated: {} new, {} improved, {} expired (dpid={})",
            total.inserted,
            total.improved,
            total.poisoned,
            dpid_to_str(state_guard.id)
        );
    }
    route_manager::deploy_routing_table(&mut state_guard, datapath);
    total
}

async fn gc_task(
    id: SwitchId,
    state: SharedSwitchState,
    datapath: Arc<dyn Datapath>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let period = state.lock().await.table.gc_interval();
    let mut interval = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("GC task shutting down (dpid={})", dpid_to_str(id));
                break;
            }
            _ = interval.tick() => {
                collect_garbage(&state, datapath.as_ref()).await;
            }
        }
    }
}

/// Ages out stale routes, drops unreachable ones with their rules and
/// prunes timed-out pending packets. Returns the removed route count.
pub async fn collect_garbage(state: &SharedSwitchState, datapath: &dyn Datapath) -> usize {
    let mut state_guard = state.lock().await;
    let now = Instant::now();

    state_guard.table.expire_at(now);
    let removed = state_guard.table.sweep_and_remove_unreachable();
    route_manager::withdraw_routes(&state_guard, datapath, &removed);

    let pruned = state_guard.pending.prune_at(now);
    if pruned > 0 {
        warn!(
            "{} pending packet(s) timed out (dpid={})",
            pruned,
            dpid_to_str(state_guard.id)
        );
    }

    if !removed.is_empty() {
        info!(
            "garbage collected {} route(s) (dpid={})",
            removed.len(),
            dpid_to_str(state_guard.id)
        );
    }
    removed.len()
}
