//! End-to-end emulation scenarios. These drive the real kernel stack
//! (namespaces, the radio driver, wmediumd, OVS) and therefore run only
//! with the `sudo-tests` feature on a prepared host:
//!
//! ```sh
//! sudo -E cargo test -p apnet --features sudo-tests --test emulation_e2e
//! ```
#![cfg(feature = "sudo-tests")]

use apnet::engine::Engine;
use apnet::intf::{WifiMode, WirelessIntf};
use apnet::link::{Link, LinkEnd, LinkKind};
use apnet::node::{default_mac, Node};
use apnet::topology::{IntfId, NodeId, Topology};
use apnet::EngineConfig;
use rfmodel::Position;
use std::time::Duration;

fn wireless_node(name: &str, idx: usize, master: bool, pos: (f64, f64, f64)) -> Node {
    let mut node = if master { Node::ap(name) } else { Node::station(name) };
    let mut wintf = WirelessIntf::new(NodeId(0), 0, format!("{}-wlan0", name), default_mac(idx, 0));
    wintf.mode = if master { WifiMode::Master } else { WifiMode::Managed };
    wintf.ssid = Some("ssid-1".into());
    node.core.position = Some(Position::new(pos.0, pos.1, pos.2));
    node.core.wintfs.push(wintf);
    node
}

fn managed_link(sta: NodeId, sta_name: &str, ap: NodeId, ap_name: &str) -> Link {
    Link {
        kind: LinkKind::Managed,
        a: LinkEnd { node: sta, wlan: Some(0), ifname: format!("{}-wlan0", sta_name) },
        b: Some(LinkEnd { node: ap, wlan: Some(0), ifname: format!("{}-wlan0", ap_name) }),
        tc: None,
        error_prob: None,
    }
}

/// Two stations joined to one AP can ping each other without loss.
#[tokio::test]
async fn two_station_ping() {
    let mut topo = Topology::new(EngineConfig::default());
    let ap1 = topo.add_node(wireless_node("ap1", 0, true, (50.0, 50.0, 0.0))).unwrap();
    let sta1 = topo.add_node(wireless_node("sta1", 1, false, (10.0, 10.0, 0.0))).unwrap();
    let sta2 = topo.add_node(wireless_node("sta2", 2, false, (20.0, 10.0, 0.0))).unwrap();
    topo.links.push(managed_link(sta1, "sta1", ap1, "ap1"));
    topo.links.push(managed_link(sta2, "sta2", ap1, "ap1"));

    let mut engine = Engine::new(topo).unwrap();
    engine.build().await.unwrap();

    // Both associations settle within 3 s.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let sta2_ip = engine
        .topology()
        .wintf(IntfId { node: sta2, wlan: 0 })
        .and_then(|w| w.ip.clone())
        .unwrap();
    let dst = sta2_ip.split('/').next().unwrap().to_string();
    let result = engine.ping("sta1", &dst, 1).await.unwrap();
    assert_eq!(result.loss_pct(), 0.0);

    engine.stop().await;
}

/// Moving a station between two same-SSID APs produces exactly one roam
/// and ends associated to the nearer AP.
#[tokio::test]
async fn mobility_handover() {
    use apnet::mobility::models::{MobileParams, Tracked};
    use apnet::mobility::{Model, MobilityCoordinator};

    let mut config = EngineConfig::default();
    config.seed = 7;
    let mut topo = Topology::new(config);
    let ap1 = topo.add_node(wireless_node("ap1", 0, true, (10.0, 30.0, 0.0))).unwrap();
    let ap2 = topo.add_node(wireless_node("ap2", 1, true, (60.0, 30.0, 0.0))).unwrap();
    let sta1 = topo.add_node(wireless_node("sta1", 2, false, (10.0, 30.0, 0.0))).unwrap();
    for ap in [ap1, ap2] {
        if let Some(w) = topo.wintf_mut(IntfId { node: ap, wlan: 0 }) {
            w.ssid = Some("handover".into());
        }
    }
    {
        let w = topo.wintf_mut(IntfId { node: sta1, wlan: 0 }).unwrap();
        w.ssid = Some("handover".into());
        w.bgscan_threshold = Some(-60.0);
    }
    topo.links.push(managed_link(sta1, "sta1", ap1, "ap1"));

    let mut engine = Engine::new(topo).unwrap();
    let mut coordinator = MobilityCoordinator::new(7);
    coordinator.add_node(
        sta1,
        Position::new(10.0, 30.0, 0.0),
        MobileParams::default(),
        // 50 m at 2 m/s.
        Model::Tracked(Tracked {
            start: Position::new(10.0, 30.0, 0.0),
            end: Position::new(60.0, 30.0, 0.0),
            start_time_s: 0.0,
            end_time_s: 25.0,
        }),
    );
    engine.set_mobility(coordinator);
    engine.build().await.unwrap();

    // Let the engine loop process mobility batches for the 25 s walk.
    tokio::select! {
        _ = engine.serve() => {}
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
    }

    let serving = engine
        .topology()
        .wintf(IntfId { node: sta1, wlan: 0 })
        .and_then(|w| w.associated_to);
    assert_eq!(serving, Some(IntfId { node: ap2, wlan: 0 }));

    engine.stop().await;
}

/// Three adhoc stations in a line: neighbors reach each other, the far
/// pair exceeds the default log-distance range.
#[tokio::test]
async fn adhoc_triangle() {
    let mut topo = Topology::new(EngineConfig::default());
    let mut ids = Vec::new();
    for (i, x) in [10.0, 50.0, 90.0].iter().enumerate() {
        let name = format!("sta{}", i + 1);
        let mut node = wireless_node(&name, i, false, (*x, 10.0, 0.0));
        node.core.wintfs[0].ssid = Some("adhocNet".into());
        node.core.wintfs[0].set_channel(5);
        ids.push(topo.add_node(node).unwrap());
    }
    for (i, id) in ids.iter().enumerate() {
        topo.links.push(Link {
            kind: LinkKind::Adhoc,
            a: LinkEnd {
                node: *id,
                wlan: Some(0),
                ifname: format!("sta{}-wlan0", i + 1),
            },
            b: None,
            tc: None,
            error_prob: None,
        });
    }

    let mut engine = Engine::new(topo).unwrap();
    engine.build().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let ip_of = |engine: &Engine, id: NodeId| {
        engine
            .topology()
            .wintf(IntfId { node: id, wlan: 0 })
            .and_then(|w| w.ip.clone())
            .unwrap()
            .split('/')
            .next()
            .unwrap()
            .to_string()
    };
    let ip2 = ip_of(&engine, ids[1]);
    let ip3 = ip_of(&engine, ids[2]);

    assert_eq!(engine.ping("sta1", &ip2, 1).await.unwrap().loss_pct(), 0.0);
    assert_eq!(engine.ping("sta2", &ip3, 1).await.unwrap().loss_pct(), 0.0);
    // 80 m apart: over the default exponent-4 range.
    assert_eq!(engine.ping("sta1", &ip3, 1).await.unwrap().loss_pct(), 100.0);

    engine.stop().await;
}

/// After build -> stop, no engine-owned namespaces, bridges or phys
/// survive, and a second cleanup is a no-op.
#[tokio::test]
async fn stop_releases_everything_and_cleanup_is_idempotent() {
    use apnet::cleanup::{sweep_host, HostExecutor};

    let mut topo = Topology::new(EngineConfig::default());
    let ap1 = topo.add_node(wireless_node("ap1", 0, true, (50.0, 50.0, 0.0))).unwrap();
    let sta1 = topo.add_node(wireless_node("sta1", 1, false, (10.0, 10.0, 0.0))).unwrap();
    topo.links.push(managed_link(sta1, "sta1", ap1, "ap1"));

    let mut engine = Engine::new(topo).unwrap();
    engine.build().await.unwrap();
    engine.stop().await;

    let netns = std::fs::read_dir("/var/run/netns")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("sta"))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(netns, 0, "leaked namespaces");

    let executor = HostExecutor::new();
    // Second invocation over already-clean state must not error.
    sweep_host(&executor, &[]).await;
    sweep_host(&executor, &[]).await;
}

/// A station added after build gets its radio on the fly and associates
/// without a module reload.
#[tokio::test]
async fn live_add_station() {
    let mut topo = Topology::new(EngineConfig::default());
    let ap1 = topo.add_node(wireless_node("ap1", 0, true, (10.0, 10.0, 0.0))).unwrap();

    let mut engine = Engine::new(topo).unwrap();
    engine.build().await.unwrap();

    let sta9 = engine
        .add_sta(wireless_node("sta9", 9, false, (0.0, 0.0, 0.0)))
        .await
        .unwrap();
    engine
        .add_link(managed_link(sta9, "sta9", ap1, "ap1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let serving = engine
        .topology()
        .wintf(IntfId { node: sta9, wlan: 0 })
        .and_then(|w| w.associated_to);
    assert_eq!(serving, Some(IntfId { node: ap1, wlan: 0 }));

    engine.stop().await;
}
