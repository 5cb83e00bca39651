//! RF-state consistency checks against an in-process stand-in for the
//! RF daemon. Nothing here needs CAP_NET_ADMIN beyond creating the
//! `/var/run/netns` directory; tests skip themselves when even that is
//! unavailable.

use apnet::config::WmediumdMode;
use apnet::engine::Engine;
use apnet::intf::WifiMode;
use apnet::link::{Link, LinkEnd, LinkKind};
use apnet::node::{default_mac, Node};
use apnet::topology::{IntfId, Topology};
use apnet::wmediumd::proto::{parse_frame, Message, STATUS_OK};
use apnet::EngineConfig;
use parking_lot::Mutex;
use rfmodel::Position;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

/// Accepts one connection, acks every frame, records decoded messages.
struct MockDaemon {
    received: Arc<Mutex<Vec<Message>>>,
}

impl MockDaemon {
    fn spawn(path: &Path) -> std::io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            loop {
                let mut len_buf = [0u8; 4];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                if stream.read_exact(&mut payload).await.is_err() {
                    return;
                }
                if let Some(msg) = parse_frame(&payload) {
                    sink.lock().push(msg);
                }
                if stream.write_all(&[STATUS_OK]).await.is_err() {
                    return;
                }
            }
        });
        Ok(Self { received })
    }
}

fn station_at(name: &str, idx: usize, pos: (f64, f64, f64)) -> Node {
    let mut node = Node::station(name);
    let mut wintf = apnet::intf::WirelessIntf::new(
        apnet::topology::NodeId(0),
        0,
        format!("{}-wlan0", name),
        default_mac(idx, 0),
    );
    wintf.ssid = Some("ssid-1".into());
    node.core.wintfs.push(wintf);
    node.core.position = Some(Position::new(pos.0, pos.1, pos.2));
    node
}

fn ap_at(name: &str, idx: usize, pos: (f64, f64, f64)) -> Node {
    let mut node = Node::ap(name);
    let mut wintf = apnet::intf::WirelessIntf::new(
        apnet::topology::NodeId(0),
        0,
        format!("{}-wlan0", name),
        default_mac(idx, 0),
    );
    wintf.mode = WifiMode::Master;
    wintf.ssid = Some("ssid-1".into());
    node.core.wintfs.push(wintf);
    node.core.position = Some(Position::new(pos.0, pos.1, pos.2));
    node
}

fn engine_or_skip(topo: Topology) -> Option<Engine> {
    match Engine::new(topo) {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("Skipping: cannot initialize engine here ({})", e);
            None
        }
    }
}

#[tokio::test]
async fn out_of_range_associate_stays_silent() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("wmd.sock");
    let daemon = MockDaemon::spawn(&sock).unwrap();

    let mut config = EngineConfig::default();
    config.wmediumd_mode = WmediumdMode::Interference;
    config.wmediumd_socket = sock.clone();
    let mut topo = Topology::new(config);
    // Kilometers apart: far outside the derived range.
    let sta = topo.add_node(station_at("sta1", 0, (0.0, 0.0, 0.0))).unwrap();
    let ap = topo.add_node(ap_at("ap1", 1, (5000.0, 0.0, 0.0))).unwrap();

    let Some(mut engine) = engine_or_skip(topo) else {
        return;
    };
    engine.connect_wmediumd().await.unwrap();

    let link = Link {
        kind: LinkKind::Managed,
        a: LinkEnd { node: sta, wlan: Some(0), ifname: "sta1-wlan0".into() },
        b: Some(LinkEnd { node: ap, wlan: Some(0), ifname: "ap1-wlan0".into() }),
        tc: None,
        error_prob: None,
    };
    engine.attach_link(&link).await.unwrap();

    // Both sides stay disassociated and no SNR message was emitted.
    let topo = engine.topology();
    let sta_intf = IntfId { node: sta, wlan: 0 };
    let ap_intf = IntfId { node: ap, wlan: 0 };
    assert_eq!(topo.wintf(sta_intf).unwrap().associated_to, None);
    assert!(topo.wintf(ap_intf).unwrap().associated_stations.is_empty());
    let snr_messages: Vec<_> = daemon
        .received
        .lock()
        .iter()
        .filter(|m| matches!(m, Message::UpdateSnr { .. }))
        .cloned()
        .collect();
    assert!(snr_messages.is_empty(), "unexpected SNR push: {:?}", snr_messages);
}

#[tokio::test]
async fn error_prob_link_reports_exact_probability() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("wmd.sock");
    let daemon = MockDaemon::spawn(&sock).unwrap();

    let mut config = EngineConfig::default();
    config.wmediumd_mode = WmediumdMode::ErrorProb;
    config.wmediumd_socket = sock.clone();
    let mut topo = Topology::new(config);
    let sta1 = topo.add_node(station_at("sta1", 0, (10.0, 10.0, 0.0))).unwrap();
    let sta3 = topo.add_node(station_at("sta3", 2, (20.0, 10.0, 0.0))).unwrap();

    let Some(mut engine) = engine_or_skip(topo) else {
        return;
    };
    engine.connect_wmediumd().await.unwrap();

    let link = Link {
        kind: LinkKind::Managed,
        a: LinkEnd { node: sta1, wlan: Some(0), ifname: "sta1-wlan0".into() },
        b: Some(LinkEnd { node: sta3, wlan: Some(0), ifname: "sta3-wlan0".into() }),
        tc: None,
        error_prob: Some(1.0),
    };
    // The association step may fail without wireless tooling; the
    // error-prob push happens first either way.
    let attach = engine.attach_link(&link).await;
    engine.topology_mut().links.push(link);

    let probs: Vec<f64> = daemon
        .received
        .lock()
        .iter()
        .filter_map(|m| match m {
            Message::UpdateErrorProb { prob, .. } => Some(*prob),
            _ => None,
        })
        .collect();
    assert_eq!(probs, vec![1.0, 1.0], "symmetric error-prob push expected");

    let wlinks = engine.wlinks();
    assert_eq!(wlinks.len(), 1);
    assert_eq!(wlinks[0].2, 1.0);
    drop(attach);
}

#[tokio::test]
async fn registration_precedes_geometry_in_the_flush() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("wmd.sock");
    let daemon = MockDaemon::spawn(&sock).unwrap();

    let mut config = EngineConfig::default();
    config.wmediumd_socket = sock.clone();
    let mut topo = Topology::new(config);
    topo.add_node(station_at("sta1", 0, (10.0, 10.0, 0.0))).unwrap();

    let Some(mut engine) = engine_or_skip(topo) else {
        return;
    };
    engine.connect_wmediumd().await.unwrap();
    engine.flush_rf_state().await.unwrap();

    let received = daemon.received.lock().clone();
    assert!(matches!(received[0], Message::RegisterInterface { .. }));
    assert!(received
        .iter()
        .any(|m| matches!(m, Message::UpdatePosition { x, y, .. } if *x == 10.0 && *y == 10.0)));
}
