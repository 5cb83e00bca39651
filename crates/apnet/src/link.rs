//! Link model
//!
//! Wired, managed, adhoc, mesh, ITS, wifi-direct, 4-address and
//! physical-mesh links. A link records its endpoints and class; the
//! class selects the attach/detach protocol the orchestrator runs. The
//! `iw`/`wpa_cli` command sequences for each wireless class are built
//! here as pure argv vectors.

use crate::topology::NodeId;
use serde::{Deserialize, Serialize};

/// Traffic-control parameters for a shaped link.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcParams {
    pub bw_mbps: Option<f64>,
    /// netem delay string, e.g. "5ms".
    pub delay: Option<String>,
    /// netem jitter string, e.g. "1ms".
    pub jitter: Option<String>,
    pub loss_pct: Option<f64>,
    pub max_queue: Option<u32>,
}

impl TcParams {
    pub fn is_empty(&self) -> bool {
        self.bw_mbps.is_none()
            && self.delay.is_none()
            && self.jitter.is_none()
            && self.loss_pct.is_none()
            && self.max_queue.is_none()
    }
}

/// Link class; selects the attach/detach protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    /// veth + tc between two nodes.
    #[default]
    Wired,
    /// Station associated to an AP master.
    Managed,
    /// Single-endpoint IBSS membership.
    Adhoc,
    /// Single-endpoint 802.11s mesh membership.
    Mesh,
    /// Single-endpoint OCB (802.11p) membership.
    Its,
    /// Supplicant-negotiated P2P link between two stations.
    WifiDirect,
    /// AP-to-AP wireless distribution via 4-address frames.
    FourAddr,
    /// A real phy moved into the node's namespace.
    PhysicalMesh,
}

impl LinkKind {
    pub fn is_wireless(&self) -> bool {
        !matches!(self, LinkKind::Wired)
    }

    /// Classes that take a single endpoint (possibly repeated across
    /// calls for more members).
    pub fn single_ended(&self) -> bool {
        matches!(self, LinkKind::Adhoc | LinkKind::Mesh | LinkKind::Its | LinkKind::PhysicalMesh)
    }
}

/// One side of a link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkEnd {
    pub node: NodeId,
    /// Wireless interfaces are addressed by wlan index.
    pub wlan: Option<usize>,
    /// Interface name as it exists in the node's namespace.
    pub ifname: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Link {
    pub kind: LinkKind,
    pub a: LinkEnd,
    pub b: Option<LinkEnd>,
    pub tc: Option<TcParams>,
    /// Per-pair loss probability in error-prob mode.
    pub error_prob: Option<f64>,
}

impl Link {
    pub fn touches(&self, node: NodeId) -> bool {
        self.a.node == node || self.b.as_ref().map(|b| b.node) == Some(node)
    }
}

fn s(v: &str) -> String {
    v.to_string()
}

/// `iw` sequence joining an interface to an IBSS cell.
pub fn adhoc_join_cmds(ifname: &str, ssid: &str, freq_mhz: u32) -> Vec<Vec<String>> {
    vec![
        vec![s("ip"), s("link"), s("set"), s(ifname), s("down")],
        vec![s("iw"), s("dev"), s(ifname), s("set"), s("type"), s("ibss")],
        vec![s("ip"), s("link"), s("set"), s(ifname), s("up")],
        vec![
            s("iw"), s("dev"), s(ifname), s("ibss"), s("join"), s(ssid),
            freq_mhz.to_string(),
        ],
    ]
}

/// `iw` sequence joining an 802.11s mesh.
pub fn mesh_join_cmds(ifname: &str, mesh_id: &str, freq_mhz: u32) -> Vec<Vec<String>> {
    vec![
        vec![s("ip"), s("link"), s("set"), s(ifname), s("down")],
        vec![s("iw"), s("dev"), s(ifname), s("set"), s("type"), s("mp")],
        vec![s("ip"), s("link"), s("set"), s(ifname), s("up")],
        vec![
            s("iw"), s("dev"), s(ifname), s("mesh"), s("join"), s(mesh_id),
            s("freq"), freq_mhz.to_string(),
        ],
    ]
}

/// `iw` sequence for OCB (802.11p) operation.
pub fn its_join_cmds(ifname: &str, freq_mhz: u32) -> Vec<Vec<String>> {
    vec![
        vec![s("ip"), s("link"), s("set"), s(ifname), s("down")],
        vec![s("iw"), s("dev"), s(ifname), s("set"), s("type"), s("ocb")],
        vec![s("ip"), s("link"), s("set"), s(ifname), s("up")],
        vec![
            s("iw"), s("dev"), s(ifname), s("ocb"), s("join"),
            freq_mhz.to_string(), s("10MHz"),
        ],
    ]
}

/// Associate a managed interface with an open AP by SSID.
pub fn associate_cmd(ifname: &str, ssid: &str, bssid: Option<&str>) -> Vec<String> {
    let mut cmd = vec![s("iw"), s("dev"), s(ifname), s("connect"), s(ssid)];
    if let Some(bssid) = bssid {
        cmd.push(s(bssid));
    }
    cmd
}

pub fn disconnect_cmd(ifname: &str) -> Vec<String> {
    vec![s("iw"), s("dev"), s(ifname), s("disconnect")]
}

/// Toggle the 4-address (WDS) bit on a client or AP interface.
pub fn four_addr_cmd(ifname: &str, enable: bool) -> Vec<String> {
    vec![
        s("iw"), s("dev"), s(ifname), s("set"), s("4addr"),
        s(if enable { "on" } else { "off" }),
    ]
}

/// wpa_cli sequence establishing a wifi-direct connection towards a
/// peer device address.
pub fn p2p_connect_cmds(ifname: &str, peer_mac: &str) -> Vec<Vec<String>> {
    vec![
        vec![s("wpa_cli"), s("-i"), s(ifname), s("p2p_find")],
        vec![
            s("wpa_cli"), s("-i"), s(ifname), s("p2p_connect"), s(peer_mac),
            s("pbc"), s("auth"),
        ],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_properties() {
        assert!(!LinkKind::Wired.is_wireless());
        assert!(LinkKind::Managed.is_wireless());
        assert!(LinkKind::Adhoc.single_ended());
        assert!(!LinkKind::Managed.single_ended());
    }

    #[test]
    fn adhoc_sequence_sets_type_before_join() {
        let cmds = adhoc_join_cmds("sta1-wlan0", "adhocNet", 2432);
        assert_eq!(cmds.len(), 4);
        assert!(cmds[1].join(" ").ends_with("set type ibss"));
        assert_eq!(cmds[3].join(" "), "iw dev sta1-wlan0 ibss join adhocNet 2432");
    }

    #[test]
    fn mesh_sequence_uses_mesh_point_type() {
        let cmds = mesh_join_cmds("sta1-wlan0", "meshNet", 2412);
        assert!(cmds[1].join(" ").ends_with("set type mp"));
        assert_eq!(
            cmds[3].join(" "),
            "iw dev sta1-wlan0 mesh join meshNet freq 2412"
        );
    }

    #[test]
    fn associate_optionally_pins_bssid() {
        assert_eq!(
            associate_cmd("sta1-wlan0", "ssid-1", None).join(" "),
            "iw dev sta1-wlan0 connect ssid-1"
        );
        assert_eq!(
            associate_cmd("sta1-wlan0", "ssid-1", Some("02:00:00:00:01:00")).join(" "),
            "iw dev sta1-wlan0 connect ssid-1 02:00:00:00:01:00"
        );
    }

    #[test]
    fn empty_tc_params_detects_absence() {
        assert!(TcParams::default().is_empty());
        let tc = TcParams {
            delay: Some("2ms".into()),
            ..Default::default()
        };
        assert!(!tc.is_empty());
    }

    #[test]
    fn link_touches_its_endpoints() {
        let link = Link {
            kind: LinkKind::Wired,
            a: LinkEnd {
                node: NodeId(0),
                wlan: None,
                ifname: "h1-eth0".into(),
            },
            b: Some(LinkEnd {
                node: NodeId(1),
                wlan: None,
                ifname: "s1-eth1".into(),
            }),
            tc: None,
            error_prob: None,
        };
        assert!(link.touches(NodeId(0)));
        assert!(link.touches(NodeId(1)));
        assert!(!link.touches(NodeId(2)));
    }
}
