//! Topology orchestrator
//!
//! Owns the build/start/stop lifecycle. `build()` runs in strict phases;
//! a phase must complete before the next begins, and any failure aborts
//! the build and replays the cleanup registry. After build the engine
//! loop is the single writer of the topology: the mobility coordinator,
//! the socket server and user calls all publish commands into its
//! mailbox.

use crate::assoc::{AssocCommand, AssociationController, AUTH_TIMEOUT};
use crate::cleanup::{CleanupAction, CleanupRegistry, HostExecutor};
use crate::config::{ip_add, parse_ip_base, WmediumdMode};
use crate::intf::{ifb_redirect_commands, tc_commands, tc_teardown_commands, WifiMode};
use crate::link::{
    adhoc_join_cmds, associate_cmd, disconnect_cmd, four_addr_cmd, its_join_cmds, mesh_join_cmds,
    p2p_connect_cmds, Link, LinkEnd, LinkKind, TcParams,
};
use crate::mobility::{MobilityCoordinator, PositionBatch};
use crate::node::{ControllerEndpoint, Node, NodeCtx, NodeKind};
use crate::topology::{IntfId, NodeId, Topology};
use crate::wmediumd::WmediumdClient;
use crate::EngineError;
use netres::docker::{DockerDriver, RunOpts};
use netres::exec::CommandRunner;
use netres::ipt::IptablesDriver;
use netres::netns::NetnsManager;
use netres::ovs::OvsDriver;
use netres::phy::{PhyDriver, RADIO_MODULE};
use netres::veth::{parse_mac, VethDriver, VethEnd};
use rfmodel::{Position, RateTable};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Grace period long-running tasks get to exit before cleanup proceeds
/// without them.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Hysteresis for pushing RF updates: changes under this are not
/// re-sent.
const RF_HYSTERESIS_DB: f64 = 1.0;

const CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands accepted by the engine mailbox.
pub enum EngineCommand {
    CommitPositions(PositionBatch),
    AuthResult {
        sta: IntfId,
        target: IntfId,
        ok: bool,
    },
    AuthTimeout {
        sta: IntfId,
        target: IntfId,
    },
    RetryAssociate {
        sta: IntfId,
        ap: IntfId,
        attempt: u32,
    },
    SetPosition {
        node: String,
        pos: Position,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    NodeShell {
        node: String,
        argv: Vec<String>,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    GetAttr {
        node: String,
        attr: String,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    PauseSimulation,
    StartSimulation,
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Parsed result of a ping run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingResult {
    pub sent: u32,
    pub received: u32,
}

impl PingResult {
    pub fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        // Duplicated replies can push received over sent.
        100.0 * self.sent.saturating_sub(self.received) as f64 / self.sent as f64
    }
}

/// Parse iputils ping output ("X packets transmitted, Y received, ...").
pub fn parse_ping(output: &str) -> Option<PingResult> {
    for line in output.lines() {
        if let Some(idx) = line.find(" packets transmitted, ") {
            let sent: u32 = line[..idx].trim().rsplit(' ').next()?.parse().ok()?;
            let rest = &line[idx + " packets transmitted, ".len()..];
            let received: u32 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(PingResult { sent, received });
        }
    }
    None
}

struct Drivers {
    runner: CommandRunner,
    netns: NetnsManager,
    veth: Option<VethDriver>,
    phy: PhyDriver,
    ovs: OvsDriver,
    ipt: IptablesDriver,
}

pub struct Engine {
    topo: Topology,
    drivers: Drivers,
    cleanup: Arc<CleanupRegistry>,
    executor: HostExecutor,
    wmediumd: Option<WmediumdClient>,
    assoc: AssociationController,
    mobility: Option<MobilityCoordinator>,
    cmd_tx: mpsc::Sender<EngineCommand>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    pos_rx: Option<mpsc::Receiver<PositionBatch>>,
    pos_tx: mpsc::Sender<PositionBatch>,
    cancel: watch::Sender<bool>,
    pause: watch::Sender<bool>,
    /// Last SNR/error value pushed per directed pair, for hysteresis.
    pushed_rf: HashMap<(IntfId, IntfId), f64>,
    mobility_task: Option<tokio::task::JoinHandle<()>>,
    next_auto_ip: u32,
    built: bool,
}

impl Engine {
    pub fn new(topo: Topology) -> Result<Self, EngineError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (pos_tx, pos_rx) = mpsc::channel(64);
        let (cancel, _) = watch::channel(false);
        let (pause, _) = watch::channel(false);
        let policy = topo.config.ac_method;
        Ok(Self {
            topo,
            drivers: Drivers {
                runner: CommandRunner::new(),
                netns: NetnsManager::new().map_err(netres::NetresError::from)?,
                veth: None,
                phy: PhyDriver::new(),
                ovs: OvsDriver::new(),
                ipt: IptablesDriver::new(),
            },
            cleanup: Arc::new(CleanupRegistry::new()),
            executor: HostExecutor::new(),
            wmediumd: None,
            assoc: AssociationController::new(policy),
            mobility: None,
            cmd_tx,
            cmd_rx,
            pos_rx: Some(pos_rx),
            pos_tx,
            cancel,
            pause,
            pushed_rf: HashMap::new(),
            mobility_task: None,
            next_auto_ip: 1,
            built: false,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topo
    }

    pub fn cleanup_registry(&self) -> Arc<CleanupRegistry> {
        self.cleanup.clone()
    }

    /// A sender for the engine mailbox, for the socket server and other
    /// external drivers.
    pub fn mailbox(&self) -> mpsc::Sender<EngineCommand> {
        self.cmd_tx.clone()
    }

    /// Configure the mobility coordinator (spawned in build phase 8).
    pub fn set_mobility(&mut self, coordinator: MobilityCoordinator) {
        self.mobility = Some(coordinator);
    }

    fn node_ctx(&self) -> NodeCtx<'_> {
        NodeCtx {
            runner: &self.drivers.runner,
            ovs: &self.drivers.ovs,
            ipt: &self.drivers.ipt,
            cleanup: &self.cleanup,
        }
    }

    /// Swap a node out of its arena slot for the duration of an
    /// operation that needs both the owned node and the drivers. The
    /// single-writer discipline makes the placeholder unobservable.
    fn take_node(&mut self, id: NodeId) -> Option<Node> {
        self.topo.node_mut(id).map(|slot| {
            std::mem::replace(
                slot,
                Node {
                    core: crate::node::NodeCore::new("__in-flight__", false),
                    kind: NodeKind::Host,
                },
            )
        })
    }

    fn put_node(&mut self, id: NodeId, node: Node) {
        if let Some(slot) = self.topo.node_mut(id) {
            *slot = node;
        }
    }

    fn has_wireless(&self) -> bool {
        self.topo
            .iter_nodes()
            .any(|(_, n)| !n.core.wintfs.is_empty())
    }

    /// Build the whole topology. Phases run strictly in order; on error
    /// the cleanup registry is replayed best-effort before returning.
    pub async fn build(&mut self) -> Result<(), EngineError> {
        match self.build_phases().await {
            Ok(()) => {
                self.built = true;
                Ok(())
            }
            Err(e) => {
                warn!("build failed ({}), tearing down", e);
                self.cleanup.run(&self.executor).await;
                Err(e)
            }
        }
    }

    async fn build_phases(&mut self) -> Result<(), EngineError> {
        // Phase 1: validation and daemon/socket bring-up.
        self.topo.config.validate()?;
        let _ = RateTable::global();
        self.topo.populate_ranges();
        if self.has_wireless() {
            self.connect_wmediumd().await?;
        }

        // Phase 2: nodes in declaration order.
        let ids: Vec<NodeId> = self.topo.iter_nodes().map(|(id, _)| id).collect();
        for id in &ids {
            self.materialize_node(*id).await?;
        }

        // Phase 3: wireless radios.
        if self.has_wireless() {
            self.create_radios(&ids).await?;
        }

        // Phase 4: addresses, routes, MACs.
        for id in &ids {
            self.configure_node(*id).await?;
        }

        // Phase 5: links, wired before wireless.
        let link_order: Vec<usize> = {
            let mut wired: Vec<usize> = Vec::new();
            let mut wireless: Vec<usize> = Vec::new();
            for (i, link) in self.topo.links.iter().enumerate() {
                if link.kind.is_wireless() {
                    wireless.push(i);
                } else {
                    wired.push(i);
                }
            }
            wired.into_iter().chain(wireless).collect()
        };
        for i in link_order {
            let link = self.topo.links[i].clone();
            self.attach_link(&link).await?;
        }

        // Phase 6: controllers, then switches/APs, then stations.
        let endpoints = self.controller_endpoints();
        for id in self.topo.controllers.clone() {
            self.start_node(id, &endpoints).await?;
        }
        for id in self
            .topo
            .switches
            .clone()
            .into_iter()
            .chain(self.topo.aps.clone())
            .chain(self.topo.wlcs.clone())
        {
            self.start_node(id, &endpoints).await?;
        }
        for id in self
            .topo
            .stations
            .clone()
            .into_iter()
            .chain(self.topo.hosts.clone())
            .chain(self.topo.nats.clone())
        {
            self.start_node(id, &endpoints).await?;
        }

        // Phase 7: initial RF flush and first-time associations.
        if self.has_wireless() {
            self.flush_rf_state().await?;
            if self.topo.config.auto_association {
                let events = self.topo.recompute_range_sets();
                let commands = self.assoc.handle_events(&self.topo, &events);
                for cmd in commands {
                    self.execute_assoc_command(cmd).await;
                }
            }
        }

        // Phase 8: mobility. Batches are bridged into the mailbox so
        // the engine loop stays the single topology writer.
        if let Some(coordinator) = self.mobility.take() {
            if !coordinator.is_empty() {
                if let Some(mut pos_rx) = self.pos_rx.take() {
                    let cmd_tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        while let Some(batch) = pos_rx.recv().await {
                            if cmd_tx
                                .send(EngineCommand::CommitPositions(batch))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });
                }
                let tx = self.pos_tx.clone();
                let pause = self.pause.subscribe();
                let cancel = self.cancel.subscribe();
                self.mobility_task = Some(tokio::spawn(coordinator.run(tx, pause, cancel)));
            }
        }

        info!("build complete: {} nodes, {} links", self.topo.node_count(), self.topo.links.len());
        Ok(())
    }

    /// Connect the RF daemon control channel (build phase 1). Public so
    /// embedders driving phases manually can bring the RF side up
    /// against their own daemon.
    pub async fn connect_wmediumd(&mut self) -> Result<(), EngineError> {
        let path = self.topo.config.wmediumd_socket.clone();
        // Bootstrap config for the daemon side; removed at cleanup.
        let bootstrap = format!("/tmp/apnet-wmd-{}.cfg", std::process::id());
        self.cleanup.record(CleanupAction::RmFileGlob(bootstrap.clone()));
        let mut conf = String::from("medium_queues = per_medium\n");
        for id in self.topo.wireless_ids() {
            if let Some(w) = self.topo.wintf(id) {
                conf.push_str(&format!("iface {} medium {}\n", w.mac, w.medium));
            }
        }
        tokio::fs::write(&bootstrap, conf)
            .await
            .map_err(|e| EngineError::Resource(netres::NetresError::Io(e)))?;

        let client = WmediumdClient::connect(&path).await?;
        self.wmediumd = Some(client);
        Ok(())
    }

    /// Phase 2 for one node: namespace or container.
    async fn materialize_node(&mut self, id: NodeId) -> Result<(), EngineError> {
        let (name, in_ns, image) = {
            let node = self
                .topo
                .node(id)
                .ok_or_else(|| EngineError::Config(format!("no node {:?}", id)))?;
            (
                node.core.name.clone(),
                node.core.in_namespace,
                node.core.docker_image.clone(),
            )
        };
        if !in_ns {
            return Ok(());
        }
        let pid = match image {
            Some(image) => {
                self.cleanup.record(CleanupAction::DockerRm(name.clone()));
                let docker = DockerDriver::connect().map_err(netres::NetresError::from)?;
                let (_, pid) = docker
                    .run(&image, &name, &RunOpts {
                        privileged: true,
                        ..Default::default()
                    })
                    .await
                    .map_err(netres::NetresError::from)?;
                pid
            }
            None => {
                // Inverse first: deleting an absent namespace is a no-op.
                self.cleanup.record(CleanupAction::DeleteNetns(name.clone()));
                self.drivers
                    .netns
                    .create(&name)
                    .await
                    .map_err(netres::NetresError::from)?
            }
        };
        if let Some(node) = self.topo.node_mut(id) {
            node.core.pid = Some(pid);
        }
        // Loopback up inside the namespace.
        self.drivers
            .runner
            .run_in(Some(name.as_str()), &["ip", "link", "set", "lo", "up"], CMD_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Phase 3: register radios on the fly, move them into their owner
    /// namespaces and rename them to the interface names.
    async fn create_radios(&mut self, ids: &[NodeId]) -> Result<(), EngineError> {
        self.cleanup
            .record(CleanupAction::RemoveKernelModule(RADIO_MODULE.to_string()));
        self.drivers
            .phy
            .load_module(0, self.topo.config.alt_module.as_deref())
            .await
            .map_err(netres::NetresError::from)?;
        if self.topo.config.ifb {
            let wlans = self
                .topo
                .iter_nodes()
                .map(|(_, n)| n.core.wintfs.len() as u32)
                .sum::<u32>();
            self.drivers
                .phy
                .load_ifb(wlans)
                .await
                .map_err(netres::NetresError::from)?;
        }
        for &id in ids {
            self.create_node_radios(id).await?;
        }
        Ok(())
    }

    async fn create_node_radios(&mut self, id: NodeId) -> Result<(), EngineError> {
        let (name, pid, wlans): (String, Option<u32>, Vec<(usize, String)>) = {
            let Some(node) = self.topo.node(id) else {
                return Ok(());
            };
            (
                node.core.name.clone(),
                node.core.pid,
                node.core
                    .wintfs
                    .iter()
                    .map(|w| (w.wlan, w.name.clone()))
                    .collect(),
            )
        };
        for (wlan, ifname) in wlans {
            let prefix = format!("{}wlan{}", name, wlan);
            let (phy_id, dev) = self
                .drivers
                .phy
                .register_phy(&prefix)
                .await
                .map_err(netres::NetresError::from)?;
            debug!("node {} wlan{} -> phy {} (id {})", name, wlan, dev, phy_id);
            self.drivers
                .phy
                .rfkill_unblock(&dev)
                .await
                .map_err(netres::NetresError::from)?;
            if let Some(pid) = pid {
                self.drivers
                    .phy
                    .move_phy_to_netns(&dev, pid)
                    .await
                    .map_err(netres::NetresError::from)?;
            }
            // down-rename-up inside the owner.
            let ns = if pid.is_some() { Some(name.as_str()) } else { None };
            self.drivers
                .runner
                .run_in_checked(ns, &["ip", "link", "set", &dev, "down"], CMD_TIMEOUT)
                .await?;
            self.drivers
                .runner
                .run_in_checked(ns, &["ip", "link", "set", &dev, "name", &ifname], CMD_TIMEOUT)
                .await?;
            self.drivers
                .runner
                .run_in_checked(ns, &["ip", "link", "set", &ifname, "up"], CMD_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    /// Phase 4 for one node: MACs, addresses and default routes.
    async fn configure_node(&mut self, id: NodeId) -> Result<(), EngineError> {
        let (base, prefix) = parse_ip_base(&self.topo.config.ip_base)?;
        let (name, ns, wintf_cfg): (String, bool, Vec<(String, String, Option<String>)>) = {
            let Some(node) = self.topo.node(id) else {
                return Ok(());
            };
            (
                node.core.name.clone(),
                node.core.in_namespace,
                node.core
                    .wintfs
                    .iter()
                    .map(|w| (w.name.clone(), w.mac.clone(), w.ip.clone()))
                    .collect(),
            )
        };
        let ns = if ns { Some(name.as_str()) } else { None };
        for (idx, (ifname, mac, ip)) in wintf_cfg.into_iter().enumerate() {
            self.drivers
                .runner
                .run_in_checked(ns, &["ip", "link", "set", &ifname, "down"], CMD_TIMEOUT)
                .await?;
            self.drivers
                .runner
                .run_in_checked(
                    ns,
                    &["ip", "link", "set", &ifname, "address", &mac],
                    CMD_TIMEOUT,
                )
                .await?;
            self.drivers
                .runner
                .run_in_checked(ns, &["ip", "link", "set", &ifname, "up"], CMD_TIMEOUT)
                .await?;
            let addr = match ip {
                Some(ip) => ip,
                None => {
                    let auto = format!("{}/{}", ip_add(self.next_auto_ip, base, prefix), prefix);
                    self.next_auto_ip += 1;
                    auto
                }
            };
            self.drivers
                .runner
                .run_in_checked(ns, &["ip", "addr", "replace", &addr, "dev", &ifname], CMD_TIMEOUT)
                .await?;
            if let Some(w) = self.topo.wintf_mut(IntfId { node: id, wlan: idx }) {
                w.ip = Some(addr);
            }
        }
        Ok(())
    }

    fn controller_endpoints(&self) -> Vec<ControllerEndpoint> {
        self.topo
            .controllers
            .iter()
            .filter_map(|id| self.topo.node(*id))
            .filter_map(|n| match &n.kind {
                NodeKind::Controller(cfg) => Some(ControllerEndpoint {
                    name: n.core.name.clone(),
                    ip: cfg.ip.clone(),
                    port: cfg.port,
                }),
                _ => None,
            })
            .collect()
    }

    async fn start_node(
        &mut self,
        id: NodeId,
        endpoints: &[ControllerEndpoint],
    ) -> Result<(), EngineError> {
        let Some(mut node) = self.take_node(id) else {
            return Ok(());
        };
        let ctx = NodeCtx {
            runner: &self.drivers.runner,
            ovs: &self.drivers.ovs,
            ipt: &self.drivers.ipt,
            cleanup: &self.cleanup,
        };
        let result = node.start(&ctx, endpoints).await;
        self.put_node(id, node);
        result
    }

    /// Phase 5: attach one link per its class.
    pub async fn attach_link(&mut self, link: &Link) -> Result<(), EngineError> {
        match link.kind {
            LinkKind::Wired => self.attach_wired(link).await,
            LinkKind::Managed => self.attach_managed(link).await,
            LinkKind::Adhoc | LinkKind::Mesh | LinkKind::Its => self.attach_membership(link).await,
            LinkKind::WifiDirect => self.attach_wifi_direct(link).await,
            LinkKind::FourAddr => self.attach_four_addr(link).await,
            LinkKind::PhysicalMesh => self.attach_physical_mesh(link).await,
        }
    }

    async fn attach_wired(&mut self, link: &Link) -> Result<(), EngineError> {
        let b = link
            .b
            .as_ref()
            .ok_or_else(|| EngineError::Config("wired link needs two endpoints".into()))?;
        if self.drivers.veth.is_none() {
            self.drivers.veth = Some(VethDriver::new().await.map_err(netres::NetresError::from)?);
        }
        let Some(veth) = self.drivers.veth.as_ref() else {
            return Err(EngineError::Config("veth driver unavailable".into()));
        };
        let pid_of = |topo: &Topology, end: &LinkEnd| {
            topo.node(end.node)
                .filter(|n| n.core.in_namespace)
                .and_then(|n| n.core.pid)
        };
        let a_end = VethEnd {
            name: link.a.ifname.clone(),
            mac: None,
            netns_pid: pid_of(&self.topo, &link.a),
        };
        let b_end = VethEnd {
            name: b.ifname.clone(),
            mac: None,
            netns_pid: pid_of(&self.topo, b),
        };
        veth.create_pair(&a_end, &b_end)
            .await
            .map_err(netres::NetresError::from)?;

        for end in [&link.a, b] {
            let ns = self
                .topo
                .node(end.node)
                .filter(|n| n.core.in_namespace)
                .map(|n| n.core.name.clone());
            self.drivers
                .runner
                .run_in_checked(
                    ns.as_deref(),
                    &["ip", "link", "set", &end.ifname, "up"],
                    CMD_TIMEOUT,
                )
                .await?;
            if let Some(tc) = &link.tc {
                if !tc.is_empty() {
                    self.apply_tc(ns.as_deref(), &end.ifname, tc).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_tc(
        &self,
        ns: Option<&str>,
        ifname: &str,
        tc: &TcParams,
    ) -> Result<(), EngineError> {
        for argv in tc_commands(ifname, tc) {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            self.drivers
                .runner
                .run_in_checked(ns, &argv, CMD_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    async fn remove_tc(&self, ns: Option<&str>, ifname: &str) {
        for argv in tc_teardown_commands(ifname) {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            let _ = self.drivers.runner.run_in(ns, &argv, CMD_TIMEOUT).await;
        }
    }

    async fn attach_managed(&mut self, link: &Link) -> Result<(), EngineError> {
        let b = link
            .b
            .as_ref()
            .ok_or_else(|| EngineError::Config("managed link needs two endpoints".into()))?;
        let (sta, ap) = self.wireless_pair(&link.a, b)?;

        match self.topo.config.wmediumd_mode {
            WmediumdMode::ErrorProb => {
                let prob = link.error_prob.unwrap_or(0.0);
                let (mac_a, mac_b) = self.pair_macs(sta, ap)?;
                if let Some(client) = &self.wmediumd {
                    client.update_error_prob(mac_a, mac_b, prob).await?;
                    client.update_error_prob(mac_b, mac_a, prob).await?;
                }
                self.do_associate(sta, ap).await?;
            }
            WmediumdMode::Interference => {
                // Out-of-range pairs are silently left disassociated; the
                // radios retry when positions change.
                self.topo.recompute_range_sets();
                let in_range = self
                    .topo
                    .wintf(sta)
                    .map(|w| w.aps_in_range.contains(&ap))
                    .unwrap_or(false);
                if in_range {
                    self.do_associate(sta, ap).await?;
                } else {
                    debug!("associate {:?} -> {:?} skipped: out of range", sta, ap);
                }
            }
        }
        if let Some(tc) = &link.tc {
            if !tc.is_empty() {
                // Without an explicit ceiling, shape at the PHY rate the
                // current signal level supports.
                let mut tc = tc.clone();
                if tc.bw_mbps.is_none() {
                    tc.bw_mbps = self.signal_rate_mbps(sta, ap);
                }
                let (ns, ifname) = self.wintf_location(sta)?;
                self.apply_tc(ns.as_deref(), &ifname, &tc).await?;
                // Shared master side shapes on its IFB mirror when
                // enabled; otherwise directly.
                if self.topo.config.ifb {
                    self.shape_master_via_ifb(ap, &tc).await?;
                } else {
                    let (ns, ifname) = self.wintf_location(ap)?;
                    self.apply_tc(ns.as_deref(), &ifname, &tc).await?;
                }
            }
        }
        Ok(())
    }

    /// PHY rate supported by the signal `sta` receives from `ap`, via
    /// the mode's rate table.
    fn signal_rate_mbps(&self, sta: IntfId, ap: IntfId) -> Option<f64> {
        let rssi = self.topo.rssi_between(sta, ap)?;
        let w = self.topo.wintf(sta)?;
        RateTable::global()
            .rate_for(w.ieee_mode, false, rssi, self.topo.config.legacy_ax_rates)
            .map(|entry| entry.rate_mbps)
    }

    async fn shape_master_via_ifb(&mut self, ap: IntfId, tc: &TcParams) -> Result<(), EngineError> {
        let ifb_index = {
            let Some(w) = self.topo.wintf(ap) else {
                return Ok(());
            };
            match w.ifb_index {
                Some(i) => i,
                None => {
                    let i = ap.node.0 as u32 * 8 + ap.wlan as u32;
                    if let Some(w) = self.topo.wintf_mut(ap) {
                        w.ifb_index = Some(i);
                    }
                    i
                }
            }
        };
        let (ns, ifname) = self.wintf_location(ap)?;
        for argv in ifb_redirect_commands(&ifname, ifb_index) {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            self.drivers
                .runner
                .run_in_checked(ns.as_deref(), &argv, CMD_TIMEOUT)
                .await?;
        }
        let ifb_name = format!("ifb{}", ifb_index);
        self.apply_tc(ns.as_deref(), &ifb_name, tc).await
    }

    async fn attach_membership(&mut self, link: &Link) -> Result<(), EngineError> {
        let id = IntfId {
            node: link.a.node,
            wlan: link.a.wlan.unwrap_or(0),
        };
        let (ssid, freq_mhz, mode) = {
            let w = self
                .topo
                .wintf(id)
                .ok_or_else(|| EngineError::Config(format!("no wireless intf {:?}", id)))?;
            (
                w.ssid.clone().unwrap_or_else(|| "apnet-cell".into()),
                (w.freq_ghz * 1000.0).round() as u32,
                link.kind,
            )
        };
        let (ns, ifname) = self.wintf_location(id)?;
        let cmds = match mode {
            LinkKind::Adhoc => {
                if let Some(w) = self.topo.wintf_mut(id) {
                    w.mode = WifiMode::Adhoc;
                }
                adhoc_join_cmds(&ifname, &ssid, freq_mhz)
            }
            LinkKind::Mesh => {
                if let Some(w) = self.topo.wintf_mut(id) {
                    w.mode = WifiMode::Mesh;
                }
                mesh_join_cmds(&ifname, &ssid, freq_mhz)
            }
            LinkKind::Its => {
                if let Some(w) = self.topo.wintf_mut(id) {
                    w.mode = WifiMode::Its;
                }
                its_join_cmds(&ifname, freq_mhz)
            }
            _ => return Err(EngineError::Config("not a membership link".into())),
        };
        for argv in cmds {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            self.drivers
                .runner
                .run_in_checked(ns.as_deref(), &argv, CMD_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    async fn attach_wifi_direct(&mut self, link: &Link) -> Result<(), EngineError> {
        let b = link
            .b
            .as_ref()
            .ok_or_else(|| EngineError::Config("wifi-direct link needs two endpoints".into()))?;
        let (a_id, b_id) = self.wireless_pair(&link.a, b)?;
        let peer_mac = self
            .topo
            .wintf(b_id)
            .map(|w| w.mac.clone())
            .ok_or_else(|| EngineError::Config("peer intf missing".into()))?;
        let (ns, ifname) = self.wintf_location(a_id)?;
        for argv in p2p_connect_cmds(&ifname, &peer_mac) {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            self.drivers
                .runner
                .run_in_checked(ns.as_deref(), &argv, CMD_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    async fn attach_four_addr(&mut self, link: &Link) -> Result<(), EngineError> {
        let b = link
            .b
            .as_ref()
            .ok_or_else(|| EngineError::Config("4addr link needs two endpoints".into()))?;
        for (end, mode) in [(&link.a, WifiMode::FourAddrClient), (b, WifiMode::FourAddrAp)] {
            let id = IntfId {
                node: end.node,
                wlan: end.wlan.unwrap_or(0),
            };
            if let Some(w) = self.topo.wintf_mut(id) {
                w.mode = mode;
            }
            let (ns, ifname) = self.wintf_location(id)?;
            let argv = four_addr_cmd(&ifname, true);
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            self.drivers
                .runner
                .run_in_checked(ns.as_deref(), &argv, CMD_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    async fn attach_physical_mesh(&mut self, link: &Link) -> Result<(), EngineError> {
        // The real phy named in the link end moves into the namespace.
        let pid = self
            .topo
            .node(link.a.node)
            .and_then(|n| n.core.pid)
            .ok_or_else(|| EngineError::Config("physical mesh endpoint has no namespace".into()))?;
        self.drivers
            .phy
            .move_phy_to_netns(&link.a.ifname, pid)
            .await
            .map_err(netres::NetresError::from)?;
        Ok(())
    }

    fn wireless_pair(&self, a: &LinkEnd, b: &LinkEnd) -> Result<(IntfId, IntfId), EngineError> {
        let a = IntfId {
            node: a.node,
            wlan: a.wlan.unwrap_or(0),
        };
        let b = IntfId {
            node: b.node,
            wlan: b.wlan.unwrap_or(0),
        };
        for id in [a, b] {
            if self.topo.wintf(id).is_none() {
                return Err(EngineError::Config(format!("no wireless intf {:?}", id)));
            }
        }
        Ok((a, b))
    }

    fn intf_mac(&self, id: IntfId) -> Result<[u8; 6], EngineError> {
        let w = self
            .topo
            .wintf(id)
            .ok_or_else(|| EngineError::Config(format!("no wireless intf {:?}", id)))?;
        parse_mac(&w.mac).map_err(|e| EngineError::Config(e.to_string()))
    }

    fn pair_macs(&self, a: IntfId, b: IntfId) -> Result<([u8; 6], [u8; 6]), EngineError> {
        Ok((self.intf_mac(a)?, self.intf_mac(b)?))
    }

    fn wintf_location(&self, id: IntfId) -> Result<(Option<String>, String), EngineError> {
        let node = self
            .topo
            .node(id.node)
            .ok_or_else(|| EngineError::Config(format!("no node {:?}", id.node)))?;
        let w = node
            .core
            .wintfs
            .get(id.wlan)
            .ok_or_else(|| EngineError::Config(format!("no wlan {} on {}", id.wlan, node.core.name)))?;
        let ns = node.netns().map(String::from);
        Ok((ns, w.name.clone()))
    }

    /// Issue the association command and commit both sides on success.
    async fn do_associate(&mut self, sta: IntfId, ap: IntfId) -> Result<(), EngineError> {
        let (ssid, bssid) = {
            let ap_intf = self
                .topo
                .wintf(ap)
                .ok_or_else(|| EngineError::Config(format!("no AP intf {:?}", ap)))?;
            (
                ap_intf.ssid.clone().unwrap_or_default(),
                ap_intf.mac.clone(),
            )
        };
        let (ns, ifname) = self.wintf_location(sta)?;
        let argv = associate_cmd(&ifname, &ssid, Some(bssid.as_str()));
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let out = self
            .drivers
            .runner
            .run_in(ns.as_deref(), &argv, CMD_TIMEOUT)
            .await?;
        if !out.success() {
            return Err(EngineError::Association(format!(
                "associate {} -> {} failed: {}",
                ifname,
                ssid,
                out.stderr.trim()
            )));
        }
        self.commit_association(sta, ap);
        Ok(())
    }

    fn commit_association(&mut self, sta: IntfId, ap: IntfId) {
        // Drop the previous association first.
        if let Some(prev) = self.topo.wintf(sta).and_then(|w| w.associated_to) {
            if let Some(prev_ap) = self.topo.wintf_mut(prev) {
                prev_ap.associated_stations.remove(&sta);
            }
        }
        if let Some(w) = self.topo.wintf_mut(sta) {
            w.associated_to = Some(ap);
        }
        if let Some(w) = self.topo.wintf_mut(ap) {
            w.associated_stations.insert(sta);
        }
    }

    fn commit_disassociation(&mut self, sta: IntfId) {
        if let Some(prev) = self.topo.wintf(sta).and_then(|w| w.associated_to) {
            if let Some(prev_ap) = self.topo.wintf_mut(prev) {
                prev_ap.associated_stations.remove(&sta);
            }
        }
        if let Some(w) = self.topo.wintf_mut(sta) {
            w.associated_to = None;
        }
    }

    /// Push the complete RF picture to the daemon: registrations,
    /// geometry, and per-pair link quality.
    pub async fn flush_rf_state(&mut self) -> Result<(), EngineError> {
        let Some(client) = self.wmediumd.clone() else {
            return Ok(());
        };
        let ids = self.topo.wireless_ids();
        for id in &ids {
            let Some(w) = self.topo.wintf(*id) else { continue };
            let mac = parse_mac(&w.mac).map_err(|e| EngineError::Config(e.to_string()))?;
            client.register(mac, w.medium).await?;
            client.update_gain(mac, w.antenna_gain_dbi).await?;
            client.update_txpower(mac, w.txpower_dbm).await?;
            if let Some(pos) = self.topo.position_of(id.node) {
                client.update_position(mac, pos.x, pos.y, pos.z).await?;
            }
        }
        if self.topo.config.wmediumd_mode == WmediumdMode::Interference {
            self.push_pairwise_snr(&ids).await?;
        }
        Ok(())
    }

    /// Recompute pairwise SNR and push values that moved more than the
    /// hysteresis. Updates for one pair stay FIFO because one client
    /// task owns the socket.
    async fn push_pairwise_snr(&mut self, ids: &[IntfId]) -> Result<(), EngineError> {
        let Some(client) = self.wmediumd.clone() else {
            return Ok(());
        };
        for (i, &a) in ids.iter().enumerate() {
            for &b in ids.iter().skip(i + 1) {
                if a.node == b.node {
                    continue;
                }
                let Some(rssi) = self.topo.rssi_between(a, b) else {
                    continue;
                };
                let snr = self.topo.config.propagation.snr(rssi);
                let last = self.pushed_rf.get(&(a, b)).copied();
                if let Some(last) = last {
                    if (snr - last).abs() < RF_HYSTERESIS_DB {
                        continue;
                    }
                }
                let (mac_a, mac_b) = self.pair_macs(a, b)?;
                client.update_snr_pair(mac_a, mac_b, snr).await?;
                self.pushed_rf.insert((a, b), snr);
            }
        }
        Ok(())
    }

    /// Change an interface's transmit power: kernel first, then the RF
    /// daemon, then the derived range.
    pub async fn set_txpower(&mut self, id: IntfId, dbm: f64) -> Result<(), EngineError> {
        let (ns, ifname) = self.wintf_location(id)?;
        // iw takes mBm.
        let mbm = format!("{}", (dbm * 100.0).round() as i64);
        self.drivers
            .runner
            .run_in_checked(
                ns.as_deref(),
                &["iw", "dev", &ifname, "set", "txpower", "fixed", &mbm],
                CMD_TIMEOUT,
            )
            .await?;
        if let Some(w) = self.topo.wintf_mut(id) {
            w.txpower_dbm = dbm;
            w.range_m = None;
        }
        self.topo.populate_ranges();
        if let Some(client) = &self.wmediumd {
            let mac = self.intf_mac(id)?;
            client.update_txpower(mac, dbm).await?;
        }
        Ok(())
    }

    /// Change an interface's antenna gain; model-side only, mirrored to
    /// the RF daemon.
    pub async fn set_antenna_gain(&mut self, id: IntfId, dbi: f64) -> Result<(), EngineError> {
        if let Some(w) = self.topo.wintf_mut(id) {
            w.antenna_gain_dbi = dbi;
            w.range_m = None;
        }
        self.topo.populate_ranges();
        if let Some(client) = &self.wmediumd {
            let mac = self.intf_mac(id)?;
            client.update_gain(mac, dbi).await?;
        }
        Ok(())
    }

    /// Retune an interface to a channel.
    pub async fn set_channel(&mut self, id: IntfId, channel: u32) -> Result<(), EngineError> {
        let (ns, ifname) = self.wintf_location(id)?;
        let ch = channel.to_string();
        self.drivers
            .runner
            .run_in_checked(
                ns.as_deref(),
                &["iw", "dev", &ifname, "set", "channel", &ch],
                CMD_TIMEOUT,
            )
            .await?;
        if let Some(w) = self.topo.wintf_mut(id) {
            w.set_channel(channel);
        }
        Ok(())
    }

    /// Pin an interface's advertised range, overriding the derived one.
    pub fn set_range(&mut self, id: IntfId, meters: f64) -> Result<(), EngineError> {
        let w = self
            .topo
            .wintf_mut(id)
            .ok_or_else(|| EngineError::Config(format!("no wireless intf {:?}", id)))?;
        w.range_m = Some(meters);
        Ok(())
    }

    /// Reassign an interface's RF medium and tell the daemon.
    pub async fn set_medium(&mut self, id: IntfId, medium: u32) -> Result<(), EngineError> {
        self.topo.set_medium(id, medium)?;
        if let Some(client) = &self.wmediumd {
            let mac = self.intf_mac(id)?;
            client.set_medium(mac, medium).await?;
        }
        Ok(())
    }

    /// Error-prob pairs for display (the `wlinks` listing).
    pub fn wlinks(&self) -> Vec<(String, String, f64)> {
        self.topo
            .links
            .iter()
            .filter(|l| l.kind.is_wireless() && l.error_prob.is_some())
            .filter_map(|l| {
                let b = l.b.as_ref()?;
                Some((
                    l.a.ifname.clone(),
                    b.ifname.clone(),
                    l.error_prob.unwrap_or(0.0),
                ))
            })
            .collect()
    }

    /// Live add of a station after build: phases 2-4 for one node.
    /// Before build this only records the node; `build()` brings it up
    /// with everything else.
    pub async fn add_sta(&mut self, node: Node) -> Result<NodeId, EngineError> {
        let id = self.topo.add_node(node)?;
        if !self.built {
            return Ok(id);
        }
        self.materialize_node(id).await?;
        self.create_node_radios(id).await?;
        self.configure_node(id).await?;
        self.flush_rf_state().await?;
        let endpoints = self.controller_endpoints();
        self.start_node(id, &endpoints).await?;
        Ok(id)
    }

    /// Live add of an AP: same path; new radios are registered on the
    /// fly so the kernel driver is never reloaded.
    pub async fn add_ap(&mut self, node: Node) -> Result<NodeId, EngineError> {
        let id = self.topo.add_node(node)?;
        if !self.built {
            return Ok(id);
        }
        self.materialize_node(id).await?;
        self.create_node_radios(id).await?;
        self.configure_node(id).await?;
        let endpoints = self.controller_endpoints();
        self.start_node(id, &endpoints).await?;
        self.flush_rf_state().await?;
        Ok(id)
    }

    /// Live add of a link after build: phase 5 for one entry.
    pub async fn add_link(&mut self, link: Link) -> Result<(), EngineError> {
        self.attach_link(&link).await?;
        self.topo.links.push(link);
        Ok(())
    }

    /// Remove a node at runtime: stop it, detach its links, release its
    /// resources.
    pub async fn del_node(&mut self, name: &str) -> Result<(), EngineError> {
        let id = self
            .topo
            .lookup(name)
            .ok_or_else(|| EngineError::Config(format!("no node '{}'", name)))?;
        if let Some(mut node) = self.take_node(id) {
            let ctx = NodeCtx {
                runner: &self.drivers.runner,
                ovs: &self.drivers.ovs,
                ipt: &self.drivers.ipt,
                cleanup: &self.cleanup,
            };
            let _ = node.stop(&ctx, true).await;
            self.put_node(id, node);
        }
        // Deregister its radios with the RF daemon.
        if let Some(client) = &self.wmediumd {
            let macs: Vec<[u8; 6]> = self
                .topo
                .node(id)
                .map(|n| {
                    n.core
                        .wintfs
                        .iter()
                        .filter_map(|w| parse_mac(&w.mac).ok())
                        .collect()
                })
                .unwrap_or_default();
            for mac in macs {
                let _ = client.del(mac).await;
            }
        }
        let action = CleanupAction::DeleteNetns(name.to_string());
        let _ = self.drivers.netns.delete(name).await;
        self.cleanup.discharge(&action);
        self.topo.links.retain(|l| !l.touches(id));
        self.topo.remove_node(id);
        Ok(())
    }

    async fn execute_assoc_command(&mut self, cmd: AssocCommand) {
        match cmd {
            AssocCommand::Associate { sta, ap, attempt: _ } => {
                let result = self.do_associate(sta, ap).await;
                let ok = result.is_ok();
                if let Err(e) = result {
                    // Association failures are logged and retried, never
                    // fatal to the topology.
                    warn!("{}", e);
                }
                if let Some(AssocCommand::Associate { sta, ap, attempt }) =
                    self.assoc.on_auth_result(sta, ap, ok)
                {
                    // The command carries the retry's attempt number;
                    // the wait before it comes from the attempt that
                    // just failed.
                    let delay = crate::assoc::backoff_delay(attempt.saturating_sub(1))
                        .unwrap_or(AUTH_TIMEOUT);
                    let tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx
                            .send(EngineCommand::RetryAssociate { sta, ap, attempt })
                            .await;
                    });
                }
            }
            AssocCommand::Disconnect { sta } => {
                if let Ok((ns, ifname)) = self.wintf_location(sta) {
                    let argv = disconnect_cmd(&ifname);
                    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
                    let _ = self
                        .drivers
                        .runner
                        .run_in(ns.as_deref(), &argv, CMD_TIMEOUT)
                        .await;
                }
                self.commit_disassociation(sta);
                self.assoc.on_disconnect(sta);
            }
        }
    }

    /// Apply one mobility batch: commit positions, refresh the RF world,
    /// and let the association controller react to crossings.
    async fn commit_positions(&mut self, batch: PositionBatch) {
        for (id, pos) in &batch {
            if let Some(node) = self.topo.node_mut(*id) {
                node.core.position = Some(*pos);
            }
        }
        if let Some(client) = self.wmediumd.clone() {
            for (id, pos) in &batch {
                let macs: Vec<[u8; 6]> = self
                    .topo
                    .node(*id)
                    .map(|n| {
                        n.core
                            .wintfs
                            .iter()
                            .filter_map(|w| parse_mac(&w.mac).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                for mac in macs {
                    if client.update_position(mac, pos.x, pos.y, pos.z).await.is_err() {
                        warn!("wmediumd update failed; RF state is stale");
                        return;
                    }
                }
            }
            if self.topo.config.wmediumd_mode == WmediumdMode::Interference {
                let ids = self.topo.wireless_ids();
                if let Err(e) = self.push_pairwise_snr(&ids).await {
                    warn!("{}", e);
                }
            }
        }
        let events = self.topo.recompute_range_sets();
        if !events.is_empty() {
            let commands = self.assoc.handle_events(&self.topo, &events);
            for cmd in commands {
                self.execute_assoc_command(cmd).await;
            }
        }
    }

    /// Pause the mobility loop.
    pub fn pause_simulation(&self) {
        let _ = self.pause.send(true);
    }

    /// Resume the mobility loop.
    pub fn start_simulation(&self) {
        let _ = self.pause.send(false);
    }

    /// Run the engine loop until a `Stop` command arrives.
    pub async fn serve(&mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_command(cmd).await {
                break;
            }
        }
    }

    async fn handle_command(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::CommitPositions(batch) => {
                self.commit_positions(batch).await;
            }
            EngineCommand::AuthResult { sta, target, ok } => {
                if let Some(retry) = self.assoc.on_auth_result(sta, target, ok) {
                    self.execute_assoc_command(retry).await;
                }
            }
            EngineCommand::AuthTimeout { sta, target } => {
                self.assoc.on_auth_timeout(sta, target);
            }
            EngineCommand::RetryAssociate { sta, ap, attempt } => {
                self.execute_assoc_command(AssocCommand::Associate { sta, ap, attempt })
                    .await;
            }
            EngineCommand::SetPosition { node, pos, reply } => {
                let result = match self.topo.lookup(&node) {
                    Some(id) => {
                        self.commit_positions(vec![(id, pos)]).await;
                        Ok(())
                    }
                    None => Err(EngineError::Config(format!("no node '{}'", node))),
                };
                let _ = reply.send(result);
            }
            EngineCommand::NodeShell { node, argv, reply } => {
                let result = self.node_shell(&node, &argv).await;
                let _ = reply.send(result);
            }
            EngineCommand::GetAttr { node, attr, reply } => {
                let _ = reply.send(self.get_attr(&node, &attr));
            }
            EngineCommand::PauseSimulation => self.pause_simulation(),
            EngineCommand::StartSimulation => self.start_simulation(),
            EngineCommand::Stop { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn node_shell(&self, node: &str, argv: &[String]) -> Result<String, EngineError> {
        let id = self
            .topo
            .lookup(node)
            .ok_or_else(|| EngineError::Config(format!("no node '{}'", node)))?;
        let n = self
            .topo
            .node(id)
            .ok_or_else(|| EngineError::Config(format!("no node '{}'", node)))?;
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let out = n.cmd(&self.node_ctx(), &argv).await?;
        Ok(out.stdout)
    }

    fn get_attr(&self, node: &str, attr: &str) -> Result<String, EngineError> {
        let id = self
            .topo
            .lookup(node)
            .ok_or_else(|| EngineError::Config(format!("no node '{}'", node)))?;
        let n = self
            .topo
            .node(id)
            .ok_or_else(|| EngineError::Config(format!("no node '{}'", node)))?;
        match attr {
            "position" => Ok(n
                .core
                .position
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unset".into())),
            "pid" => Ok(n.core.pid.map(|p| p.to_string()).unwrap_or_default()),
            "kind" => Ok(n.kind.label().to_string()),
            other => {
                if let Some(rest) = other.strip_prefix("wlan") {
                    if let Ok(wlan) = rest.parse::<usize>() {
                        if let Some(w) = n.core.wintfs.get(wlan) {
                            return Ok(format!(
                                "{} mode={} ssid={} txpower={}",
                                w.name,
                                w.mode,
                                w.ssid.as_deref().unwrap_or("-"),
                                w.txpower_dbm
                            ));
                        }
                    }
                }
                Err(EngineError::Config(format!("unknown attribute '{}'", other)))
            }
        }
    }

    /// Wait until every switch and AP bridge reports a connected
    /// controller, polling twice a second up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let bridges: Vec<String> = self
            .topo
            .switches
            .iter()
            .chain(self.topo.aps.iter())
            .filter_map(|id| self.topo.node(*id))
            .map(|n| n.core.name.clone())
            .collect();
        let mut remaining = bridges;
        while !remaining.is_empty() {
            let mut still_waiting = Vec::new();
            for bridge in remaining {
                match self.drivers.ovs.is_connected(&bridge).await {
                    Ok(true) => {}
                    _ => still_waiting.push(bridge),
                }
            }
            remaining = still_waiting;
            if remaining.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("bridges still unconnected: {:?}", remaining);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        true
    }

    /// Bring every link between two nodes administratively up or down.
    pub async fn config_links_status(
        &mut self,
        a: &str,
        b: &str,
        up: bool,
    ) -> Result<(), EngineError> {
        let a_id = self
            .topo
            .lookup(a)
            .ok_or_else(|| EngineError::Config(format!("no node '{}'", a)))?;
        let b_id = self
            .topo
            .lookup(b)
            .ok_or_else(|| EngineError::Config(format!("no node '{}'", b)))?;
        let state = if up { "up" } else { "down" };
        let links: Vec<Link> = self
            .topo
            .links
            .iter()
            .filter(|l| l.touches(a_id) && l.touches(b_id))
            .cloned()
            .collect();
        if links.is_empty() {
            return Err(EngineError::Config(format!("no links between {} and {}", a, b)));
        }
        for link in links {
            let mut ends = vec![&link.a];
            if let Some(bb) = &link.b {
                ends.push(bb);
            }
            for end in ends {
                let ns = self
                    .topo
                    .node(end.node)
                    .filter(|n| n.core.in_namespace)
                    .map(|n| n.core.name.clone());
                self.drivers
                    .runner
                    .run_in_checked(
                        ns.as_deref(),
                        &["ip", "link", "set", &end.ifname, state],
                        CMD_TIMEOUT,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Ping helper for scenario verification.
    pub async fn ping(
        &self,
        src: &str,
        dst_ip: &str,
        count: u32,
    ) -> Result<PingResult, EngineError> {
        let count_str = count.to_string();
        let out = self
            .node_shell(
                src,
                &[
                    "ping".into(),
                    "-c".into(),
                    count_str,
                    "-W".into(),
                    "1".into(),
                    dst_ip.into(),
                ],
            )
            .await?;
        parse_ping(&out)
            .ok_or_else(|| EngineError::ExternalTool(format!("unparseable ping output: {}", out)))
    }

    /// All-pairs reachability over stations and hosts. Failures to even
    /// run ping are reported as full loss rather than aborting the
    /// sweep.
    pub async fn ping_all(&self, count: u32) -> Vec<(String, String, PingResult)> {
        let mut endpoints: Vec<(String, String)> = Vec::new();
        for id in self.topo.stations.iter().chain(self.topo.hosts.iter()) {
            let Some(node) = self.topo.node(*id) else { continue };
            let ip = node
                .core
                .wintfs
                .iter()
                .filter_map(|w| w.ip.clone())
                .chain(node.core.intfs.values().filter_map(|i| i.ip.clone()))
                .next();
            if let Some(ip) = ip {
                let bare = ip.split('/').next().unwrap_or(&ip).to_string();
                endpoints.push((node.core.name.clone(), bare));
            }
        }
        let mut results = Vec::new();
        for (src, _) in &endpoints {
            for (dst, dst_ip) in &endpoints {
                if src == dst {
                    continue;
                }
                let result = match self.ping(src, dst_ip, count).await {
                    Ok(result) => result,
                    Err(_) => PingResult { sent: count, received: 0 },
                };
                results.push((src.clone(), dst.clone(), result));
            }
        }
        results
    }

    /// Stop everything in inverse build order, then drain the cleanup
    /// registry.
    pub async fn stop(&mut self) {
        info!("stopping topology");
        // Mobility first; it completes the in-flight tick and exits.
        let _ = self.cancel.send(true);
        if let Some(task) = self.mobility_task.take() {
            if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
                // An uncooperative task does not get to block teardown.
                warn!("mobility task ignored the grace period; proceeding with cleanup");
            }
        }

        for id in self.topo.controllers.clone() {
            self.stop_node(id).await;
        }

        // Close links: shaping off, veths deleted with their namespaces.
        let links = self.topo.links.clone();
        for link in &links {
            if link.kind == LinkKind::Wired {
                if let Some(b) = &link.b {
                    for end in [&link.a, b] {
                        let ns = self
                            .topo
                            .node(end.node)
                            .filter(|n| n.core.in_namespace)
                            .map(|n| n.core.name.clone());
                        self.remove_tc(ns.as_deref(), &end.ifname).await;
                    }
                }
                if let Some(veth) = &self.drivers.veth {
                    let _ = veth.delete_if_exists(&link.a.ifname).await;
                }
            }
        }

        // Remaining nodes: switches/APs, then stations/hosts.
        let rest: Vec<NodeId> = self
            .topo
            .switches
            .clone()
            .into_iter()
            .chain(self.topo.aps.clone())
            .chain(self.topo.wlcs.clone())
            .chain(self.topo.stations.clone())
            .chain(self.topo.hosts.clone())
            .chain(self.topo.nats.clone())
            .collect();
        for id in rest {
            self.stop_node(id).await;
        }

        // Drain the RF daemon connection.
        if let Some(client) = self.wmediumd.take() {
            for id in self.topo.wireless_ids() {
                if let Some(w) = self.topo.wintf(id) {
                    if let Ok(mac) = parse_mac(&w.mac) {
                        let _ = client.del(mac).await;
                    }
                }
            }
        }

        // Finally the registry, inverse of everything recorded.
        self.cleanup.run(&self.executor).await;
        self.built = false;
        info!("stop complete");
    }

    async fn stop_node(&mut self, id: NodeId) {
        let Some(mut node) = self.take_node(id) else {
            return;
        };
        let ctx = NodeCtx {
            runner: &self.drivers.runner,
            ovs: &self.drivers.ovs,
            ipt: &self.drivers.ipt,
            cleanup: &self.cleanup,
        };
        if let Err(e) = node.stop(&ctx, false).await {
            warn!("stop of {} reported: {}", node.core.name, e);
        }
        self.put_node(id, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_output_parses() {
        let out = "PING 10.0.0.2 (10.0.0.2) 56(84) bytes of data.\n\
                   64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=0.055 ms\n\n\
                   --- 10.0.0.2 ping statistics ---\n\
                   1 packets transmitted, 1 received, 0% packet loss, time 0ms\n";
        let result = parse_ping(out).unwrap();
        assert_eq!(result, PingResult { sent: 1, received: 1 });
        assert_eq!(result.loss_pct(), 0.0);
    }

    #[test]
    fn ping_loss_is_computed() {
        let out = "--- x ---\n10 packets transmitted, 7 received, 30% packet loss, time 9s\n";
        let result = parse_ping(out).unwrap();
        assert_eq!(result.loss_pct(), 30.0);
        assert!(parse_ping("garbage").is_none());
    }
}
