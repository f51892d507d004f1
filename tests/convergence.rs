use pretty_assertions::assert_eq;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use routing_flow::protocol::NodeOptions;
use routing_flow::protocol::routing_table::TimerConfig;
use routing_flow::southbound::{FlowAction, RecordingDatapath};
use routing_flow::types::{MacAddr, PortNo, Subnet, SwitchId};
use routing_flow::{Controller, LinkEnd, PortDesc};

const ADVERTISE: Duration = Duration::from_secs(30);

fn mac(switch: SwitchId, port_no: PortNo) -> MacAddr {
    MacAddr::new(0, 0, 0, 0, switch as u8, port_no as u8)
}

fn desc(switch: SwitchId, port_no: PortNo) -> PortDesc {
    PortDesc {
        port_no,
        hw_addr: mac(switch, port_no),
        name: format!("s{}-eth{}", switch, port_no),
    }
}

fn net(s: &str) -> Subnet {
    s.parse().unwrap()
}

/// Starts `n` switches in a line. Switch `i` owns `10.0.i.0/24` on port 1;
/// port 2 faces switch `i - 1` and port 3 faces switch `i + 1`.
async fn line(n: SwitchId) -> (Controller, Vec<Arc<RecordingDatapath>>) {
    let controller = Controller::new(NodeOptions::default());
    let mut datapaths = Vec::new();

    for id in 1..=n {
        let dp = Arc::new(RecordingDatapath::new());
        controller
            .add_switch_with_timers(
                id,
                format!("s{}", id),
                dp.clone(),
                TimerConfig::from_advertise_interval(ADVERTISE),
            )
            .await;
        controller.add_port(id, desc(id, 1)).await;
        controller
            .set_gateway(id, 1, Ipv4Addr::new(10, 0, id as u8, 1), 24, Ipv6Addr::UNSPECIFIED, 0)
            .await
            .unwrap();
        datapaths.push(dp);
    }

    for id in 1..n {
        controller
            .add_link(
                LinkEnd { switch: id, port: desc(id, 3) },
                LinkEnd { switch: id + 1, port: desc(id + 1, 2) },
            )
            .await;
    }

    (controller, datapaths)
}

async fn metric(controller: &Controller, id: SwitchId, subnet: &str) -> Option<u8> {
    let switch = controller.switch(id).await.unwrap();
    let state = switch.state().lock().await;
    state.table.get(&net(subnet)).map(|entry| entry.metric)
}

#[tokio::test(start_paused = true)]
async fn neighbor_subnet_is_learned_and_programmed() {
    let (controller, datapaths) = line(2).await;

    sleep(ADVERTISE + Duration::from_secs(1)).await;

    assert_eq!(metric(&controller, 1, "10.0.2.0/24").await, Some(1));
    assert_eq!(metric(&controller, 2, "10.0.1.0/24").await, Some(1));
    assert_eq!(metric(&controller, 1, "10.0.1.0/24").await, Some(0));

    let switch = controller.switch(1).await.unwrap();
    {
        let state = switch.state().lock().await;
        let entry = state.table.get(&net("10.0.2.0/24")).unwrap();
        let hop = entry.next_hop.unwrap();
        assert_eq!((hop.switch, hop.port_no), (2, 2));
        assert_eq!(entry.local_interface, 3);
    }

    let rules = datapaths[0].installed();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].matches.nw_dst, net("10.0.2.0/24"));
    assert_eq!(
        rules[0].actions,
        vec![
            FlowAction::SetDlSrc(mac(1, 3)),
            FlowAction::SetDlDst(mac(2, 2)),
            FlowAction::Output(3),
        ]
    );

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn routes_propagate_across_a_line() {
    let (controller, _datapaths) = line(3).await;

    sleep(ADVERTISE * 2 + Duration::from_secs(1)).await;

    assert_eq!(metric(&controller, 3, "10.0.1.0/24").await, Some(2));
    assert_eq!(metric(&controller, 1, "10.0.3.0/24").await, Some(2));
    assert_eq!(metric(&controller, 2, "10.0.1.0/24").await, Some(1));
    assert_eq!(metric(&controller, 2, "10.0.3.0/24").await, Some(1));
    // local rows never lose their authority
    for id in 1..=3u64 {
        assert_eq!(metric(&controller, id, &format!("10.0.{}.0/24", id)).await, Some(0));
    }

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_neighbor_routes_age_out() {
    let (controller, datapaths) = line(2).await;

    sleep(ADVERTISE + Duration::from_secs(1)).await;
    assert_eq!(metric(&controller, 1, "10.0.2.0/24").await, Some(1));

    controller.remove_switch(2).await;

    // learned by t=30 at the latest: poisoned once older than 90s and
    // collected by the GC pass at t=180 at the latest
    sleep(Duration::from_secs(160)).await;
    assert_eq!(metric(&controller, 1, "10.0.2.0/24").await, None);
    assert_eq!(metric(&controller, 1, "10.0.1.0/24").await, Some(0));

    let removed = datapaths[0].removed();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].nw_dst, net("10.0.2.0/24"));

    controller.shutdown().await;
}
