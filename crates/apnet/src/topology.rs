//! Topology arena
//!
//! Nodes live in an arena keyed by `NodeId`; every cross-reference
//! (link endpoints, association pointers, range sets) is an id, never an
//! owning pointer, which is what lets the node/interface/peer graph be
//! cyclic without reference counting. A single writer task owns the
//! arena; everything else sees snapshots.

use crate::config::EngineConfig;
use crate::intf::{WiredIntf, WirelessIntf};
use crate::link::Link;
use crate::node::{Node, NodeKind};
use crate::EngineError;
use rfmodel::{Position, RateTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// A wireless interface addressed as (owning node, wlan index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntfId {
    pub node: NodeId,
    pub wlan: usize,
}

/// Range-set changes produced by a propagation recomputation. These are
/// what the association controller reacts to.
#[derive(Clone, Debug, PartialEq)]
pub enum RangeEvent {
    ApEntered { sta: IntfId, ap: IntfId },
    ApLeft { sta: IntfId, ap: IntfId },
    /// The serving AP's signal fell under the station's bgscan
    /// threshold.
    RssiBelowBgscan { sta: IntfId, ap: IntfId, rssi: f64 },
}

/// Process-wide topology state. Names are globally unique; the name
/// index and the per-kind collections agree at every quiescent point.
#[derive(Debug)]
pub struct Topology {
    pub config: EngineConfig,
    nodes: Vec<Option<Node>>,
    name_index: HashMap<String, NodeId>,
    pub links: Vec<Link>,
    pub stations: Vec<NodeId>,
    pub aps: Vec<NodeId>,
    pub hosts: Vec<NodeId>,
    pub switches: Vec<NodeId>,
    pub controllers: Vec<NodeId>,
    pub wlcs: Vec<NodeId>,
    pub nats: Vec<NodeId>,
}

impl Topology {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            name_index: HashMap::new(),
            links: Vec::new(),
            stations: Vec::new(),
            aps: Vec::new(),
            hosts: Vec::new(),
            switches: Vec::new(),
            controllers: Vec::new(),
            wlcs: Vec::new(),
            nats: Vec::new(),
        }
    }

    /// Insert a node, enforcing global name uniqueness.
    pub fn add_node(&mut self, mut node: Node) -> Result<NodeId, EngineError> {
        let name = node.core.name.clone();
        if self.name_index.contains_key(&name) {
            return Err(EngineError::Config(format!("duplicate node name '{}'", name)));
        }
        let id = NodeId(self.nodes.len());
        // Back-references follow the arena slot, whatever the caller
        // seeded them with.
        for (wlan, wintf) in node.core.wintfs.iter_mut().enumerate() {
            wintf.node = id;
            wintf.wlan = wlan;
        }
        for intf in node.core.intfs.values_mut() {
            intf.node = id;
        }
        let kind_list = match node.kind {
            NodeKind::Station(_) => &mut self.stations,
            NodeKind::Ap(_) => &mut self.aps,
            NodeKind::Host => &mut self.hosts,
            NodeKind::Switch(_) => &mut self.switches,
            NodeKind::Controller(_) => &mut self.controllers,
            NodeKind::Wlc => &mut self.wlcs,
            NodeKind::Nat(_) => &mut self.nats,
        };
        kind_list.push(id);
        self.nodes.push(Some(node));
        self.name_index.insert(name, id);
        Ok(id)
    }

    /// Remove a node, leaving a tombstone so ids stay stable.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.0)?.take()?;
        self.name_index.remove(&node.core.name);
        for list in [
            &mut self.stations,
            &mut self.aps,
            &mut self.hosts,
            &mut self.switches,
            &mut self.controllers,
            &mut self.wlcs,
            &mut self.nats,
        ] {
            list.retain(|n| *n != id);
        }
        // Drop dangling references held by other interfaces.
        for slot in self.nodes.iter_mut().flatten() {
            for wintf in &mut slot.core.wintfs {
                if wintf.associated_to.map(|p| p.node) == Some(id) {
                    wintf.associated_to = None;
                }
                wintf.associated_stations.retain(|p| p.node != id);
                wintf.aps_in_range.retain(|p| p.node != id);
                wintf.stations_in_range.retain(|p| p.node != id);
            }
        }
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.lookup(name).and_then(|id| self.node(id))
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i), n)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn wintf(&self, id: IntfId) -> Option<&WirelessIntf> {
        self.node(id.node).and_then(|n| n.core.wintfs.get(id.wlan))
    }

    pub fn wintf_mut(&mut self, id: IntfId) -> Option<&mut WirelessIntf> {
        self.node_mut(id.node)
            .and_then(|n| n.core.wintfs.get_mut(id.wlan))
    }

    pub fn wired_intf(&self, node: NodeId, name: &str) -> Option<&WiredIntf> {
        self.node(node).and_then(|n| n.core.intfs.get(name))
    }

    /// All wireless interface ids in arena order.
    pub fn wireless_ids(&self) -> Vec<IntfId> {
        let mut ids = Vec::new();
        for (node_id, node) in self.iter_nodes() {
            for wintf in &node.core.wintfs {
                ids.push(IntfId {
                    node: node_id,
                    wlan: wintf.wlan,
                });
            }
        }
        ids
    }

    pub fn position_of(&self, id: NodeId) -> Option<Position> {
        self.node(id).and_then(|n| n.core.position)
    }

    /// Received power at `rx` for frames transmitted by `tx`, or `None`
    /// when either side lacks a position or they sit on different
    /// mediums.
    pub fn rssi_between(&self, rx: IntfId, tx: IntfId) -> Option<f64> {
        let rx_intf = self.wintf(rx)?;
        let tx_intf = self.wintf(tx)?;
        if rx_intf.medium != tx_intf.medium {
            return None;
        }
        let rx_pos = self.position_of(rx.node)?;
        let tx_pos = self.position_of(tx.node)?;
        let distance = rx_pos.distance_to(&tx_pos);
        let (rssi, clamped) = self.config.propagation.rssi_detailed(
            &tx_intf.radio_spec(),
            &rx_intf.radio_spec(),
            distance,
        );
        if clamped {
            warn!(
                "propagation produced a non-finite value for {} -> {}, clamped below noise",
                tx_intf.name, rx_intf.name
            );
        }
        Some(rssi)
    }

    /// Recompute every interface's `aps_in_range`/`stations_in_range`
    /// from current positions, returning the crossings. This is the
    /// commit step of a mobility tick: sets are replaced wholesale so a
    /// partially computed tick can never be observed.
    pub fn recompute_range_sets(&mut self) -> Vec<RangeEvent> {
        let ids = self.wireless_ids();
        let noise_th = self.config.propagation.noise_th;
        let mut events = Vec::new();

        // Snapshot phase: compute next sets without touching state.
        let mut next: Vec<(IntfId, std::collections::BTreeSet<IntfId>, std::collections::BTreeSet<IntfId>)> =
            Vec::with_capacity(ids.len());
        for &i in &ids {
            let mut aps = std::collections::BTreeSet::new();
            let mut stations = std::collections::BTreeSet::new();
            for &j in &ids {
                if i == j || i.node == j.node {
                    continue;
                }
                let Some(rssi) = self.rssi_between(i, j) else {
                    continue;
                };
                if rssi < noise_th {
                    continue;
                }
                let peer_is_master = self.wintf(j).map(|p| p.mode.is_master()).unwrap_or(false);
                if peer_is_master {
                    aps.insert(j);
                } else {
                    stations.insert(j);
                }
            }
            next.push((i, aps, stations));
        }

        // Commit phase: swap sets in, emitting events for the deltas.
        for (i, aps, stations) in next {
            let serving = self.wintf(i).and_then(|w| w.associated_to);
            let bgscan = self.wintf(i).and_then(|w| w.bgscan_threshold);
            let Some(wintf) = self.wintf_mut(i) else { continue };
            let old_aps = std::mem::replace(&mut wintf.aps_in_range, aps.clone());
            wintf.stations_in_range = stations;

            if wintf.mode.is_client() {
                for ap in aps.difference(&old_aps) {
                    events.push(RangeEvent::ApEntered { sta: i, ap: *ap });
                }
                for ap in old_aps.difference(&aps) {
                    events.push(RangeEvent::ApLeft { sta: i, ap: *ap });
                }
            }

            // Bgscan crossing for the serving AP.
            if let (Some(ap), Some(threshold)) = (serving, bgscan) {
                if let Some(rssi) = self.rssi_between(i, ap) {
                    if rssi < threshold {
                        events.push(RangeEvent::RssiBelowBgscan { sta: i, ap, rssi });
                    }
                }
            }
        }
        events
    }

    /// Assign an interface to an RF medium.
    pub fn set_medium(&mut self, id: IntfId, medium: u32) -> Result<(), EngineError> {
        let wintf = self
            .wintf_mut(id)
            .ok_or_else(|| EngineError::Config(format!("no such interface {:?}", id)))?;
        wintf.medium = medium;
        Ok(())
    }

    /// Derive and cache the range of every wireless interface that
    /// doesn't carry an explicit one. An 802.11 mode the rate table
    /// cannot resolve degrades to the exponent-4 fallback.
    pub fn populate_ranges(&mut self) {
        let ids = self.wireless_ids();
        for id in ids {
            let Some(wintf) = self.wintf(id) else { continue };
            if wintf.range_m.is_some() {
                continue;
            }
            let spec = wintf.radio_spec();
            let gain = wintf.antenna_gain_dbi;
            let range = self.config.propagation.range_for_mode(
                &spec,
                gain,
                wintf.ieee_mode,
                RateTable::global(),
            );
            if let Some(wintf) = self.wintf_mut(id) {
                wintf.range_m = Some(range);
            }
        }
    }
}
