//! Node model
//!
//! Station / AP / Host / Switch / Controller / WLC / NAT lifecycle. A
//! node is created by the orchestrator, configured (addresses, routes),
//! started (datapath/controller/daemon processes), and finally stopped;
//! resources it acquired are released through the cleanup registry.
//!
//! Nodes never reach into the kernel themselves: every side effect goes
//! through the drivers handed in via [`NodeCtx`], and every acquired
//! resource registers its inverse first.

use crate::cleanup::{CleanupAction, CleanupRegistry};
use crate::intf::{ap_daemon_conf, supplicant_conf, ApDaemonOpts, WiredIntf, WirelessIntf};
use crate::EngineError;
use netres::exec::{CommandRunner, ExecOutput};
use netres::ipt::{nat_rules, IptRule, IptablesDriver};
use netres::ovs::OvsDriver;
use rfmodel::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

const CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver handles a node operation needs.
pub struct NodeCtx<'a> {
    pub runner: &'a CommandRunner,
    pub ovs: &'a OvsDriver,
    pub ipt: &'a IptablesDriver,
    pub cleanup: &'a CleanupRegistry,
}

/// Where a controller listens, handed to APs and switches at start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerEndpoint {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl ControllerEndpoint {
    pub fn target(&self) -> String {
        format!("tcp:{}:{}", self.ip, self.port)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StationCfg {
    /// Auto-connect to this SSID at start via a generated supplicant
    /// config.
    pub auto_connect: bool,
    /// Default gateway installed at configure time.
    pub gateway: Option<String>,
    #[serde(skip)]
    pub supplicant_confs: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApCfg {
    pub daemon_opts: ApDaemonOpts,
    #[serde(skip)]
    pub conf_paths: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SwitchCfg {
    pub dpid: Option<String>,
    /// OpenFlow protocol versions, e.g. "OpenFlow13".
    pub protocols: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerCfg {
    pub ip: String,
    pub port: u16,
    /// Executable spawned at start.
    pub command: String,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: 6653,
            command: "ovs-testcontroller".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NatCfg {
    pub subnet: String,
    pub int_iface: String,
    pub ext_iface: String,
    #[serde(skip)]
    pub rules: Vec<IptRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeKind {
    Station(StationCfg),
    Ap(ApCfg),
    Host,
    Switch(SwitchCfg),
    Controller(ControllerCfg),
    Wlc,
    Nat(NatCfg),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Station(_) => "station",
            NodeKind::Ap(_) => "ap",
            NodeKind::Host => "host",
            NodeKind::Switch(_) => "switch",
            NodeKind::Controller(_) => "controller",
            NodeKind::Wlc => "wlc",
            NodeKind::Nat(_) => "nat",
        }
    }
}

/// Identity and state shared by every node variant.
#[derive(Clone, Debug)]
pub struct NodeCore {
    pub name: String,
    /// Sentinel (or container init) pid when namespaced.
    pub pid: Option<u32>,
    pub in_namespace: bool,
    /// Run inside a Docker container instead of a bare namespace.
    pub docker_image: Option<String>,
    pub wintfs: Vec<WirelessIntf>,
    pub intfs: BTreeMap<String, WiredIntf>,
    pub position: Option<Position>,
    /// Mobility speed bounds (vmin, vmax) in m/s.
    pub speed: Option<(f64, f64)>,
    /// Free-form typed params carried from the topology description.
    pub params: BTreeMap<String, String>,
    pub started: bool,
}

impl NodeCore {
    pub fn new(name: &str, in_namespace: bool) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            in_namespace,
            docker_image: None,
            wintfs: Vec::new(),
            intfs: BTreeMap::new(),
            position: None,
            speed: None,
            params: BTreeMap::new(),
            started: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub core: NodeCore,
    pub kind: NodeKind,
}

impl Node {
    pub fn station(name: &str) -> Self {
        Self {
            core: NodeCore::new(name, true),
            kind: NodeKind::Station(StationCfg::default()),
        }
    }

    pub fn ap(name: &str) -> Self {
        // APs stay in the root namespace; their bridge wires them to the
        // controllers.
        Self {
            core: NodeCore::new(name, false),
            kind: NodeKind::Ap(ApCfg::default()),
        }
    }

    pub fn host(name: &str) -> Self {
        Self {
            core: NodeCore::new(name, true),
            kind: NodeKind::Host,
        }
    }

    pub fn switch(name: &str) -> Self {
        Self {
            core: NodeCore::new(name, false),
            kind: NodeKind::Switch(SwitchCfg::default()),
        }
    }

    pub fn controller(name: &str) -> Self {
        Self {
            core: NodeCore::new(name, false),
            kind: NodeKind::Controller(ControllerCfg::default()),
        }
    }

    pub fn wlc(name: &str) -> Self {
        Self {
            core: NodeCore::new(name, true),
            kind: NodeKind::Wlc,
        }
    }

    pub fn nat(name: &str) -> Self {
        Self {
            core: NodeCore::new(name, false),
            kind: NodeKind::Nat(NatCfg::default()),
        }
    }

    /// The namespace commands run in, `None` for root-namespace nodes.
    pub fn netns(&self) -> Option<&str> {
        if self.core.in_namespace {
            Some(self.core.name.as_str())
        } else {
            None
        }
    }

    /// Run an argv inside the node's namespace. The per-node command
    /// stream is FIFO: the runner serializes on the namespace name.
    pub async fn cmd(&self, ctx: &NodeCtx<'_>, argv: &[&str]) -> Result<ExecOutput, EngineError> {
        Ok(ctx.runner.run_in(self.netns(), argv, CMD_TIMEOUT).await?)
    }

    /// Like [`cmd`](Self::cmd) but non-zero exit is an error.
    pub async fn cmd_checked(
        &self,
        ctx: &NodeCtx<'_>,
        argv: &[&str],
    ) -> Result<ExecOutput, EngineError> {
        Ok(ctx.runner.run_in_checked(self.netns(), argv, CMD_TIMEOUT).await?)
    }

    /// Install the default route through `gateway`.
    pub async fn set_default_route(
        &self,
        ctx: &NodeCtx<'_>,
        gateway: &str,
    ) -> Result<(), EngineError> {
        self.cmd_checked(ctx, &["ip", "route", "replace", "default", "via", gateway])
            .await?;
        Ok(())
    }

    /// Install a static route to `dst` via `via`.
    pub async fn set_static_route(
        &self,
        ctx: &NodeCtx<'_>,
        dst: &str,
        via: &str,
    ) -> Result<(), EngineError> {
        self.cmd_checked(ctx, &["ip", "route", "replace", dst, "via", via])
            .await?;
        Ok(())
    }

    /// Add a static ARP entry on `dev`, used by the all-pairs static
    /// ARP option.
    pub async fn set_arp(
        &self,
        ctx: &NodeCtx<'_>,
        dev: &str,
        ip: &str,
        mac: &str,
    ) -> Result<(), EngineError> {
        self.cmd_checked(ctx, &["ip", "neigh", "replace", ip, "lladdr", mac, "dev", dev])
            .await?;
        Ok(())
    }

    /// Start the node's processes. APs get the controllers list.
    pub async fn start(
        &mut self,
        ctx: &NodeCtx<'_>,
        controllers: &[ControllerEndpoint],
    ) -> Result<(), EngineError> {
        if self.core.started {
            return Ok(());
        }
        match &mut self.kind {
            NodeKind::Controller(cfg) => {
                let listen = format!("ptcp:{}", cfg.port);
                ctx.cleanup
                    .record(CleanupAction::KillByPattern(cfg.command.clone()));
                ctx.cleanup.record(CleanupAction::FuserKillPort(cfg.port));
                ctx.runner
                    .run_in_checked(None, &[cfg.command.as_str(), "--detach", listen.as_str()], CMD_TIMEOUT)
                    .await?;
                info!("Started controller {} on {}", self.core.name, listen);
            }
            NodeKind::Switch(cfg) => {
                ctx.cleanup
                    .record(CleanupAction::DeleteBridge(self.core.name.clone()));
                ctx.ovs
                    .add_bridge(&self.core.name)
                    .await
                    .map_err(netres::NetresError::from)?;
                if let Some(protocols) = &cfg.protocols {
                    ctx.ovs
                        .set_openflow_protocols(&self.core.name, protocols)
                        .await
                        .map_err(netres::NetresError::from)?;
                }
                let targets: Vec<String> = controllers.iter().map(|c| c.target()).collect();
                if !targets.is_empty() {
                    ctx.ovs
                        .set_controllers(&self.core.name, &targets)
                        .await
                        .map_err(netres::NetresError::from)?;
                }
                if let Some(sflow) = netres::ovs::SflowParams::from_env() {
                    ctx.ovs
                        .enable_sflow(&self.core.name, &sflow)
                        .await
                        .map_err(netres::NetresError::from)?;
                }
            }
            NodeKind::Ap(cfg) => {
                start_ap(&self.core, cfg, ctx, controllers).await?;
            }
            NodeKind::Station(cfg) => {
                start_station(&self.core, cfg, ctx).await?;
            }
            NodeKind::Nat(cfg) => {
                start_nat(&self.core, cfg, ctx).await?;
            }
            NodeKind::Host | NodeKind::Wlc => {}
        }
        self.core.started = true;
        Ok(())
    }

    /// Stop the node. Safe to call more than once; `delete_intfs` also
    /// removes its wired interfaces.
    pub async fn stop(&mut self, ctx: &NodeCtx<'_>, delete_intfs: bool) -> Result<(), EngineError> {
        if self.core.started {
            match &mut self.kind {
                NodeKind::Controller(cfg) => {
                    let _ = ctx
                        .runner
                        .run_in(None, &["pkill", "-f", &cfg.command], CMD_TIMEOUT)
                        .await;
                }
                NodeKind::Switch(_) => {
                    let action = CleanupAction::DeleteBridge(self.core.name.clone());
                    if ctx.ovs.del_bridge(&self.core.name).await.is_ok() {
                        ctx.cleanup.discharge(&action);
                    }
                }
                NodeKind::Ap(cfg) => {
                    for conf in &cfg.conf_paths {
                        let pattern = conf.to_string_lossy();
                        let _ = ctx
                            .runner
                            .run_in(None, &["pkill", "-f", &pattern], CMD_TIMEOUT)
                            .await;
                    }
                    let action = CleanupAction::DeleteBridge(self.core.name.clone());
                    if ctx.ovs.del_bridge(&self.core.name).await.is_ok() {
                        ctx.cleanup.discharge(&action);
                    }
                }
                NodeKind::Station(cfg) => {
                    for conf in &cfg.supplicant_confs {
                        let pattern = conf.to_string_lossy();
                        let _ = ctx
                            .runner
                            .run_in(None, &["pkill", "-f", &pattern], CMD_TIMEOUT)
                            .await;
                    }
                }
                NodeKind::Nat(cfg) => {
                    for rule in &cfg.rules {
                        let action = CleanupAction::DetachIptablesRule {
                            ns: None,
                            rule: rule.clone(),
                        };
                        if ctx.ipt.delete(None, rule).await.is_ok() {
                            ctx.cleanup.discharge(&action);
                        }
                    }
                    cfg.rules.clear();
                }
                NodeKind::Host | NodeKind::Wlc => {}
            }
            self.core.started = false;
        }

        if delete_intfs {
            let names: Vec<String> = self.core.intfs.keys().cloned().collect();
            for name in names {
                let _ = self.cmd(ctx, &["ip", "link", "del", "dev", &name]).await;
            }
        }
        debug!("Stopped node {}", self.core.name);
        Ok(())
    }
}

async fn start_ap(
    core: &NodeCore,
    cfg: &mut ApCfg,
    ctx: &NodeCtx<'_>,
    controllers: &[ControllerEndpoint],
) -> Result<(), EngineError> {
    // Bridge first; its ports are wired to the controllers.
    ctx.cleanup
        .record(CleanupAction::DeleteBridge(core.name.clone()));
    ctx.ovs
        .add_bridge(&core.name)
        .await
        .map_err(netres::NetresError::from)?;
    let targets: Vec<String> = controllers.iter().map(|c| c.target()).collect();
    if !targets.is_empty() {
        ctx.ovs
            .set_controllers(&core.name, &targets)
            .await
            .map_err(netres::NetresError::from)?;
    }
    if let Some(sflow) = netres::ovs::SflowParams::from_env() {
        ctx.ovs
            .enable_sflow(&core.name, &sflow)
            .await
            .map_err(netres::NetresError::from)?;
    }

    for wintf in &core.wintfs {
        if !wintf.mode.is_master() {
            continue;
        }
        let conf = ap_daemon_conf(wintf, &core.name, &cfg.daemon_opts);
        let path = PathBuf::from(format!("/tmp/{}.apconf", wintf.name));
        ctx.cleanup
            .record(CleanupAction::RmFileGlob(path.to_string_lossy().into_owned()));
        ctx.cleanup
            .record(CleanupAction::KillByPattern(path.to_string_lossy().into_owned()));
        tokio::fs::write(&path, conf)
            .await
            .map_err(|e| EngineError::Resource(netres::NetresError::Io(e)))?;
        let path_str = path.to_string_lossy().into_owned();
        ctx.runner
            .run_in_checked(None, &["hostapd", "-B", &path_str], CMD_TIMEOUT)
            .await?;
        cfg.conf_paths.push(path);
        info!("Started AP daemon for {} on bridge {}", wintf.name, core.name);
    }
    Ok(())
}

async fn start_station(
    core: &NodeCore,
    cfg: &mut StationCfg,
    ctx: &NodeCtx<'_>,
) -> Result<(), EngineError> {
    if let Some(gw) = cfg.gateway.clone() {
        let out = ctx
            .runner
            .run_in(
                Some(core.name.as_str()),
                &["ip", "route", "replace", "default", "via", &gw],
                CMD_TIMEOUT,
            )
            .await?;
        if !out.success() {
            warn!("Default route for {} failed: {}", core.name, out.stderr.trim());
        }
    }
    if !cfg.auto_connect {
        return Ok(());
    }
    for wintf in &core.wintfs {
        if !wintf.mode.is_client() || wintf.ssid.is_none() {
            continue;
        }
        let conf = supplicant_conf(wintf);
        let path = PathBuf::from(format!("/tmp/{}.staconf", wintf.name));
        ctx.cleanup
            .record(CleanupAction::RmFileGlob(path.to_string_lossy().into_owned()));
        ctx.cleanup
            .record(CleanupAction::KillByPattern(path.to_string_lossy().into_owned()));
        tokio::fs::write(&path, conf)
            .await
            .map_err(|e| EngineError::Resource(netres::NetresError::Io(e)))?;
        let path_str = path.to_string_lossy().into_owned();
        ctx.runner
            .run_in_checked(
                Some(core.name.as_str()),
                &[
                    "wpa_supplicant",
                    "-B",
                    "-D",
                    "nl80211",
                    "-i",
                    &wintf.name,
                    "-c",
                    &path_str,
                ],
                CMD_TIMEOUT,
            )
            .await?;
        cfg.supplicant_confs.push(path);
        debug!("Started supplicant for {}", wintf.name);
    }
    Ok(())
}

async fn start_nat(
    core: &NodeCore,
    cfg: &mut NatCfg,
    ctx: &NodeCtx<'_>,
) -> Result<(), EngineError> {
    ctx.ipt
        .enable_ip_forward(None)
        .await
        .map_err(netres::NetresError::from)?;
    let rules = nat_rules(&cfg.subnet, &cfg.int_iface, &cfg.ext_iface);
    for rule in rules {
        // Inverse before forward: a crash right after record is a no-op
        // delete at cleanup time.
        ctx.cleanup.record(CleanupAction::DetachIptablesRule {
            ns: None,
            rule: rule.clone(),
        });
        ctx.ipt
            .append(None, &rule)
            .await
            .map_err(netres::NetresError::from)?;
        cfg.rules.push(rule);
    }
    info!("NAT {} masquerading {}", core.name, cfg.subnet);
    Ok(())
}

/// Sequential locally administered MAC for (node index, wlan index).
pub fn default_mac(node_idx: usize, wlan: usize) -> String {
    let serial = (node_idx as u32) * 16 + wlan as u32 + 1;
    format!(
        "02:00:00:00:{:02x}:{:02x}",
        (serial >> 8) & 0xff,
        serial & 0xff
    )
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::intf::{WifiMode, WirelessIntf};
    use crate::topology::NodeId;

    /// A station with one managed interface, positioned if requested.
    pub fn station_node(name: &str, pos: Option<(f64, f64, f64)>) -> Node {
        let mut node = Node::station(name);
        let mut wintf = WirelessIntf::new(
            NodeId(0),
            0,
            format!("{}-wlan0", name),
            default_mac(0, 0),
        );
        wintf.ssid = Some("ssid-1".into());
        node.core.wintfs.push(wintf);
        node.core.position = pos.map(|(x, y, z)| Position::new(x, y, z));
        node
    }

    /// An AP with one master interface.
    pub fn ap_node(name: &str, pos: Option<(f64, f64, f64)>) -> Node {
        let mut node = Node::ap(name);
        let mut wintf = WirelessIntf::new(
            NodeId(0),
            0,
            format!("{}-wlan1", name),
            default_mac(1, 0),
        );
        wintf.mode = WifiMode::Master;
        wintf.ssid = Some("ssid-1".into());
        node.core.wintfs.push(wintf);
        node.core.position = pos.map(|(x, y, z)| Position::new(x, y, z));
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_macs_are_unique_and_local() {
        let a = default_mac(0, 0);
        let b = default_mac(0, 1);
        let c = default_mac(1, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("02:"));
    }

    #[test]
    fn namespaced_nodes_expose_their_netns() {
        let sta = Node::station("sta1");
        assert_eq!(sta.netns(), Some("sta1"));
        let ap = Node::ap("ap1");
        assert_eq!(ap.netns(), None);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(Node::station("s").kind.label(), "station");
        assert_eq!(Node::nat("n").kind.label(), "nat");
    }
}
