//! Topology persistence
//!
//! Saves and loads the declarative part of a topology as a JSON document
//! with top-level keys `version, application, controllers, hosts,
//! stations, switches, aps, wlcs, links`. Positions are stringified
//! `"x,y,z"`, MACs are colon-hex. Unknown fields are ignored with a
//! warning so documents written by newer builds still load.

use crate::config::EngineConfig;
use crate::intf::{Encryption, WifiMode, WirelessIntf};
use crate::link::{Link, LinkEnd, LinkKind, TcParams};
use crate::node::Node;
use crate::topology::{NodeId, Topology};
use crate::EngineError;
use rfmodel::Position;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

pub const DOC_VERSION: &str = "1.0";
pub const APPLICATION: &str = "apnet";

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct WlanDoc {
    pub mac: String,
    pub mode: WifiMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    pub channel: u32,
    pub band: u32,
    pub ieee: String,
    pub txpower: f64,
    pub antenna_gain: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    pub medium: u32,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NodeDoc {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wlans: Vec<WlanDoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LinkDoc {
    pub kind: LinkKind,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_wlan: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_wlan: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tc: Option<TcParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_prob: Option<f64>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyDoc {
    pub version: String,
    pub application: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controllers: Vec<NodeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<NodeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stations: Vec<NodeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub switches: Vec<NodeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aps: Vec<NodeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wlcs: Vec<NodeDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkDoc>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

fn wlan_doc(intf: &WirelessIntf) -> WlanDoc {
    WlanDoc {
        mac: intf.mac.clone(),
        mode: intf.mode,
        ssid: intf.ssid.clone(),
        channel: intf.channel,
        band: intf.band_mhz,
        ieee: intf.ieee_mode.to_string(),
        txpower: intf.txpower_dbm,
        antenna_gain: intf.antenna_gain_dbi,
        encryption: match intf.encryption {
            Encryption::None => None,
            Encryption::Wep => Some("wep".into()),
            Encryption::Wpa => Some("wpa".into()),
            Encryption::Wpa2 => Some("wpa2".into()),
            Encryption::Wpa3 => Some("wpa3".into()),
            Encryption::Dot1x => Some("8021x".into()),
        },
        passphrase: intf.passphrase.clone(),
        medium: intf.medium,
        unknown: BTreeMap::new(),
    }
}

fn node_doc(node: &Node) -> NodeDoc {
    NodeDoc {
        name: node.core.name.clone(),
        position: node.core.position.map(|p| p.to_string()),
        wlans: node.core.wintfs.iter().map(wlan_doc).collect(),
        ip: node.core.wintfs.iter().find_map(|w| w.ip.clone()),
        unknown: BTreeMap::new(),
    }
}

/// Serialize the declarative topology state.
pub fn save(topo: &Topology) -> TopologyDoc {
    let collect = |ids: &[NodeId]| -> Vec<NodeDoc> {
        ids.iter()
            .filter_map(|id| topo.node(*id))
            .map(node_doc)
            .collect()
    };
    let links = topo
        .links
        .iter()
        .filter_map(|link| {
            let from = topo.node(link.a.node)?.core.name.clone();
            let to = link
                .b
                .as_ref()
                .and_then(|b| topo.node(b.node))
                .map(|n| n.core.name.clone());
            Some(LinkDoc {
                kind: link.kind,
                from,
                from_wlan: link.a.wlan,
                to,
                to_wlan: link.b.as_ref().and_then(|b| b.wlan),
                tc: link.tc.clone(),
                error_prob: link.error_prob,
                unknown: BTreeMap::new(),
            })
        })
        .collect();
    TopologyDoc {
        version: DOC_VERSION.to_string(),
        application: APPLICATION.to_string(),
        controllers: collect(&topo.controllers),
        hosts: collect(&topo.hosts),
        stations: collect(&topo.stations),
        switches: collect(&topo.switches),
        aps: collect(&topo.aps),
        wlcs: collect(&topo.wlcs),
        links,
        unknown: BTreeMap::new(),
    }
}

pub fn to_json(topo: &Topology) -> Result<String, EngineError> {
    serde_json::to_string_pretty(&save(topo))
        .map_err(|e| EngineError::Config(format!("serialize: {}", e)))
}

fn warn_unknown(ctx: &str, unknown: &BTreeMap<String, Value>) {
    for key in unknown.keys() {
        warn!("Ignoring unknown field '{}' in {}", key, ctx);
    }
}

fn apply_wlans(node: &mut Node, docs: &[WlanDoc], default_ssid: &str) -> Result<(), EngineError> {
    for (wlan, doc) in docs.iter().enumerate() {
        warn_unknown(&format!("{} wlan{}", node.core.name, wlan), &doc.unknown);
        let mut intf = WirelessIntf::new(
            NodeId(0),
            wlan,
            format!("{}-wlan{}", node.core.name, wlan),
            doc.mac.clone(),
        );
        intf.mode = doc.mode;
        intf.ssid = doc.ssid.clone().or_else(|| Some(default_ssid.to_string()));
        intf.set_channel(doc.channel);
        intf.band_mhz = doc.band;
        intf.ieee_mode = doc
            .ieee
            .parse()
            .map_err(|e: rfmodel::RfModelError| EngineError::Config(e.to_string()))?;
        intf.txpower_dbm = doc.txpower;
        intf.antenna_gain_dbi = doc.antenna_gain;
        intf.encryption = doc
            .encryption
            .as_deref()
            .unwrap_or("none")
            .parse()?;
        intf.passphrase = doc.passphrase.clone();
        intf.medium = doc.medium;
        node.core.wintfs.push(intf);
    }
    Ok(())
}

fn load_node(doc: &NodeDoc, make: fn(&str) -> Node, default_ssid: &str) -> Result<Node, EngineError> {
    warn_unknown(&doc.name, &doc.unknown);
    let mut node = make(&doc.name);
    if let Some(pos) = &doc.position {
        let position: Position = pos
            .parse()
            .map_err(|e: rfmodel::RfModelError| EngineError::Config(e.to_string()))?;
        node.core.position = Some(position);
    }
    apply_wlans(&mut node, &doc.wlans, default_ssid)?;
    if let Some(ip) = &doc.ip {
        if let Some(first) = node.core.wintfs.first_mut() {
            first.ip = Some(ip.clone());
        }
    }
    Ok(node)
}

/// Rebuild a topology from a document.
pub fn load(doc: &TopologyDoc, config: EngineConfig) -> Result<Topology, EngineError> {
    warn_unknown("topology", &doc.unknown);
    if doc.application != APPLICATION {
        warn!(
            "Document written by '{}', expected '{}'; loading anyway",
            doc.application, APPLICATION
        );
    }
    let default_ssid = config.ssid.clone();
    let mut topo = Topology::new(config);
    for d in &doc.controllers {
        topo.add_node(load_node(d, Node::controller, &default_ssid)?)?;
    }
    for d in &doc.hosts {
        topo.add_node(load_node(d, Node::host, &default_ssid)?)?;
    }
    for d in &doc.stations {
        topo.add_node(load_node(d, Node::station, &default_ssid)?)?;
    }
    for d in &doc.switches {
        topo.add_node(load_node(d, Node::switch, &default_ssid)?)?;
    }
    for d in &doc.aps {
        let mut node = load_node(d, Node::ap, &default_ssid)?;
        // Master mode is implied for AP wlans that didn't spell it out.
        for wintf in &mut node.core.wintfs {
            if wintf.mode == WifiMode::Managed {
                wintf.mode = WifiMode::Master;
            }
        }
        topo.add_node(node)?;
    }
    for d in &doc.wlcs {
        topo.add_node(load_node(d, Node::wlc, &default_ssid)?)?;
    }
    for d in &doc.links {
        warn_unknown(&format!("link {} -> {:?}", d.from, d.to), &d.unknown);
        let a_node = topo
            .lookup(&d.from)
            .ok_or_else(|| EngineError::Config(format!("link references unknown node '{}'", d.from)))?;
        let b = match &d.to {
            Some(to) => {
                let b_node = topo
                    .lookup(to)
                    .ok_or_else(|| EngineError::Config(format!("link references unknown node '{}'", to)))?;
                Some(LinkEnd {
                    node: b_node,
                    wlan: d.to_wlan,
                    ifname: end_ifname(&topo, b_node, d.to_wlan),
                })
            }
            None => None,
        };
        let link = Link {
            kind: d.kind,
            a: LinkEnd {
                node: a_node,
                wlan: d.from_wlan,
                ifname: end_ifname(&topo, a_node, d.from_wlan),
            },
            b,
            tc: d.tc.clone(),
            error_prob: d.error_prob,
        };
        topo.links.push(link);
    }
    Ok(topo)
}

fn end_ifname(topo: &Topology, node: NodeId, wlan: Option<usize>) -> String {
    let name = topo
        .node(node)
        .map(|n| n.core.name.clone())
        .unwrap_or_default();
    match wlan {
        Some(w) => format!("{}-wlan{}", name, w),
        None => format!("{}-eth0", name),
    }
}

pub fn from_json(s: &str, config: EngineConfig) -> Result<Topology, EngineError> {
    let doc: TopologyDoc =
        serde_json::from_str(s).map_err(|e| EngineError::Config(format!("parse: {}", e)))?;
    load(&doc, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_support::{ap_node, station_node};

    fn sample_topology() -> Topology {
        let mut topo = Topology::new(EngineConfig::default());
        let sta = topo.add_node(station_node("sta1", Some((10.0, 10.0, 0.0)))).unwrap();
        let ap = topo.add_node(ap_node("ap1", Some((50.0, 50.0, 0.0)))).unwrap();
        topo.add_node(Node::controller("c0")).unwrap();
        topo.links.push(Link {
            kind: LinkKind::Managed,
            a: LinkEnd { node: sta, wlan: Some(0), ifname: "sta1-wlan0".into() },
            b: Some(LinkEnd { node: ap, wlan: Some(0), ifname: "ap1-wlan0".into() }),
            tc: None,
            error_prob: None,
        });
        topo
    }

    #[test]
    fn save_load_save_round_trips() {
        let topo = sample_topology();
        let json1 = to_json(&topo).unwrap();
        let loaded = from_json(&json1, EngineConfig::default()).unwrap();
        let json2 = to_json(&loaded).unwrap();
        let v1: Value = serde_json::from_str(&json1).unwrap();
        let v2: Value = serde_json::from_str(&json2).unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn positions_are_stringified_triples() {
        let doc = save(&sample_topology());
        assert_eq!(doc.stations[0].position.as_deref(), Some("10,10,0"));
        assert_eq!(doc.version, DOC_VERSION);
        assert_eq!(doc.application, APPLICATION);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let json = r#"{
            "version": "1.0",
            "application": "apnet",
            "stations": [{"name": "sta1", "frobnicator": 7}],
            "futuristic_key": {"nested": true}
        }"#;
        let topo = from_json(json, EngineConfig::default()).unwrap();
        assert!(topo.lookup("sta1").is_some());
    }

    #[test]
    fn links_to_unknown_nodes_fail_loading() {
        let json = r#"{
            "version": "1.0",
            "application": "apnet",
            "stations": [{"name": "sta1"}],
            "links": [{"kind": "managed", "from": "sta1", "to": "ghost"}]
        }"#;
        let err = from_json(json, EngineConfig::default()).unwrap_err();
        assert_eq!(err.tag(), "ConfigError");
    }

    #[test]
    fn ap_wlans_default_to_master_mode() {
        let json = r#"{
            "version": "1.0",
            "application": "apnet",
            "aps": [{"name": "ap1", "wlans": [{"mac": "02:00:00:00:01:00",
                     "mode": "managed", "channel": 1, "band": 20, "ieee": "g",
                     "txpower": 14.0, "antenna_gain": 5.0, "medium": 0}]}]
        }"#;
        let topo = from_json(json, EngineConfig::default()).unwrap();
        let ap = topo.lookup("ap1").unwrap();
        assert_eq!(topo.node(ap).unwrap().core.wintfs[0].mode, WifiMode::Master);
    }
}
