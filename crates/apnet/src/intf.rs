//! Interface model
//!
//! Typed records for wired and wireless interfaces plus the pure helpers
//! that turn them into kernel and daemon configuration: channel/frequency
//! mapping, hostapd and wpa_supplicant config synthesis, and the tc
//! (htb + netem) command sequences for link shaping. Applying these to a
//! namespace goes through the node layer; computing them is side-effect
//! free and unit tested here.

use crate::link::TcParams;
use crate::topology::{IntfId, NodeId};
use crate::EngineError;
use rfmodel::{IeeeMode, RadioSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Operating mode of a wireless interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WifiMode {
    #[default]
    Managed,
    Master,
    Adhoc,
    Mesh,
    Ibss,
    #[serde(rename = "4addr-client")]
    FourAddrClient,
    #[serde(rename = "4addr-ap")]
    FourAddrAp,
    PhyAp,
    Its,
    WifiDirect,
}

impl WifiMode {
    /// Whether this mode participates in RF geometry as a client.
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            WifiMode::Managed | WifiMode::FourAddrClient | WifiMode::WifiDirect
        )
    }

    pub fn is_master(&self) -> bool {
        matches!(self, WifiMode::Master | WifiMode::FourAddrAp | WifiMode::PhyAp)
    }
}

impl fmt::Display for WifiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WifiMode::Managed => "managed",
            WifiMode::Master => "master",
            WifiMode::Adhoc => "adhoc",
            WifiMode::Mesh => "mesh",
            WifiMode::Ibss => "ibss",
            WifiMode::FourAddrClient => "4addr-client",
            WifiMode::FourAddrAp => "4addr-ap",
            WifiMode::PhyAp => "phy-ap",
            WifiMode::Its => "its",
            WifiMode::WifiDirect => "wifi-direct",
        };
        f.write_str(s)
    }
}

impl FromStr for WifiMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(WifiMode::Managed),
            "master" => Ok(WifiMode::Master),
            "adhoc" => Ok(WifiMode::Adhoc),
            "mesh" => Ok(WifiMode::Mesh),
            "ibss" => Ok(WifiMode::Ibss),
            "4addr-client" => Ok(WifiMode::FourAddrClient),
            "4addr-ap" => Ok(WifiMode::FourAddrAp),
            "phy-ap" => Ok(WifiMode::PhyAp),
            "its" => Ok(WifiMode::Its),
            "wifi-direct" => Ok(WifiMode::WifiDirect),
            other => Err(EngineError::Config(format!("unknown wifi mode '{}'", other))),
        }
    }
}

/// Link-layer security on a wireless interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    None,
    Wep,
    Wpa,
    Wpa2,
    Wpa3,
    #[serde(rename = "8021x")]
    Dot1x,
}

impl FromStr for Encryption {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Encryption::None),
            "wep" => Ok(Encryption::Wep),
            "wpa" => Ok(Encryption::Wpa),
            "wpa2" => Ok(Encryption::Wpa2),
            "wpa3" => Ok(Encryption::Wpa3),
            "8021x" => Ok(Encryption::Dot1x),
            other => Err(EngineError::Config(format!("unknown encryption '{}'", other))),
        }
    }
}

/// A wired interface (veth end) on a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WiredIntf {
    pub node: NodeId,
    pub name: String,
    pub mac: String,
    pub ip: Option<String>,
    pub tc: Option<TcParams>,
}

/// A wireless interface backed by a virtual phy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WirelessIntf {
    pub node: NodeId,
    pub wlan: usize,
    pub name: String,
    pub mac: String,
    pub mode: WifiMode,
    pub channel: u32,
    pub band_mhz: u32,
    pub freq_ghz: f64,
    pub ieee_mode: IeeeMode,
    pub txpower_dbm: f64,
    pub antenna_gain_dbi: f64,
    pub antenna_height_m: f64,
    /// Usable range in meters; derived from the propagation model when
    /// absent.
    pub range_m: Option<f64>,
    pub ssid: Option<String>,
    pub encryption: Encryption,
    pub passphrase: Option<String>,
    pub identity: Option<String>,
    pub ip: Option<String>,
    /// Peer interface this managed interface is associated to.
    pub associated_to: Option<IntfId>,
    /// Stations associated to this master interface.
    pub associated_stations: BTreeSet<IntfId>,
    /// Master interfaces currently within range.
    pub aps_in_range: BTreeSet<IntfId>,
    /// Client interfaces currently within range.
    pub stations_in_range: BTreeSet<IntfId>,
    /// IFB mirror index when per-peer shaping is active.
    pub ifb_index: Option<u32>,
    /// RF isolation class; frames only interact within one medium.
    pub medium: u32,
    /// RSSI threshold that triggers background-scan roaming.
    pub bgscan_threshold: Option<f64>,
}

impl WirelessIntf {
    pub fn new(node: NodeId, wlan: usize, name: String, mac: String) -> Self {
        Self {
            node,
            wlan,
            name,
            mac,
            mode: WifiMode::Managed,
            channel: 1,
            band_mhz: 20,
            freq_ghz: channel_to_freq_ghz(1),
            ieee_mode: IeeeMode::G,
            txpower_dbm: 14.0,
            antenna_gain_dbi: 5.0,
            antenna_height_m: 1.0,
            range_m: None,
            ssid: None,
            encryption: Encryption::None,
            passphrase: None,
            identity: None,
            ip: None,
            associated_to: None,
            associated_stations: BTreeSet::new(),
            aps_in_range: BTreeSet::new(),
            stations_in_range: BTreeSet::new(),
            ifb_index: None,
            medium: 0,
            bgscan_threshold: None,
        }
    }

    pub fn id(&self) -> IntfId {
        IntfId {
            node: self.node,
            wlan: self.wlan,
        }
    }

    /// The radio parameters the propagation engine consumes.
    pub fn radio_spec(&self) -> RadioSpec {
        RadioSpec {
            txpower_dbm: self.txpower_dbm,
            antenna_gain_dbi: self.antenna_gain_dbi,
            antenna_height_m: self.antenna_height_m,
            freq_ghz: self.freq_ghz,
        }
    }

    pub fn set_channel(&mut self, channel: u32) {
        self.channel = channel;
        self.freq_ghz = channel_to_freq_ghz(channel);
    }
}

/// Center frequency in GHz for an 802.11 channel number. 2.4 GHz
/// channels 1-14, 5 GHz channels from 36 up, 6 GHz from 191 up.
pub fn channel_to_freq_ghz(channel: u32) -> f64 {
    match channel {
        14 => 2.484,
        c if c <= 13 => 2.407 + 0.005 * c as f64,
        c if c < 191 => 5.000 + 0.005 * c as f64,
        c => 5.950 + 0.005 * (c - 190) as f64,
    }
}

/// Options that shape the generated AP daemon configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApDaemonOpts {
    /// 802.11w management frame protection (0/1/2).
    pub ieee80211w: Option<u8>,
    /// 802.11r fast transition mobility domain (4 hex digits).
    pub mobility_domain: Option<String>,
    pub client_isolation: bool,
    pub wps_state: Option<u8>,
}

/// Synthesize the hostapd-style configuration for a master interface.
pub fn ap_daemon_conf(intf: &WirelessIntf, bridge: &str, opts: &ApDaemonOpts) -> String {
    let mut conf = String::new();
    let ssid = intf.ssid.as_deref().unwrap_or("default-ssid");
    conf.push_str(&format!("interface={}\n", intf.name));
    conf.push_str(&format!("bridge={}\n", bridge));
    conf.push_str(&format!("ssid={}\n", ssid));
    conf.push_str(&format!("channel={}\n", intf.channel));
    let hw_mode = match intf.ieee_mode {
        IeeeMode::A | IeeeMode::Ac => "a",
        IeeeMode::B => "b",
        _ => "g",
    };
    conf.push_str(&format!("hw_mode={}\n", hw_mode));
    if matches!(intf.ieee_mode, IeeeMode::N | IeeeMode::Ac | IeeeMode::Ax | IeeeMode::Be) {
        conf.push_str("ieee80211n=1\n");
    }
    if matches!(intf.ieee_mode, IeeeMode::Ac) {
        conf.push_str("ieee80211ac=1\n");
    }
    if matches!(intf.ieee_mode, IeeeMode::Ax | IeeeMode::Be) {
        conf.push_str("ieee80211ax=1\n");
    }
    match intf.encryption {
        Encryption::None => {}
        Encryption::Wep => {
            conf.push_str("wep_default_key=0\n");
            if let Some(pass) = &intf.passphrase {
                conf.push_str(&format!("wep_key0={}\n", pass));
            }
        }
        Encryption::Wpa | Encryption::Wpa2 => {
            let ver = if intf.encryption == Encryption::Wpa { 1 } else { 2 };
            conf.push_str(&format!("wpa={}\n", ver));
            conf.push_str("wpa_key_mgmt=WPA-PSK\n");
            conf.push_str("rsn_pairwise=CCMP\n");
            if let Some(pass) = &intf.passphrase {
                conf.push_str(&format!("wpa_passphrase={}\n", pass));
            }
        }
        Encryption::Wpa3 => {
            conf.push_str("wpa=2\n");
            conf.push_str("wpa_key_mgmt=SAE\n");
            conf.push_str("rsn_pairwise=CCMP\n");
            conf.push_str("ieee80211w=2\n");
            if let Some(pass) = &intf.passphrase {
                conf.push_str(&format!("sae_password={}\n", pass));
            }
        }
        Encryption::Dot1x => {
            conf.push_str("wpa=2\n");
            conf.push_str("wpa_key_mgmt=WPA-EAP\n");
            conf.push_str("ieee8021x=1\n");
        }
    }
    if let Some(w) = opts.ieee80211w {
        if intf.encryption != Encryption::Wpa3 {
            conf.push_str(&format!("ieee80211w={}\n", w));
        }
    }
    if let Some(md) = &opts.mobility_domain {
        conf.push_str(&format!("mobility_domain={}\n", md));
        conf.push_str("ft_over_ds=1\n");
    }
    if opts.client_isolation {
        conf.push_str("ap_isolate=1\n");
    }
    if let Some(wps) = opts.wps_state {
        conf.push_str(&format!("wps_state={}\n", wps));
    }
    conf
}

/// Synthesize the wpa_supplicant network block for a station interface
/// that auto-connects to its configured SSID.
pub fn supplicant_conf(intf: &WirelessIntf) -> String {
    let mut conf = String::new();
    conf.push_str("ctrl_interface=/var/run/wpa_supplicant\n");
    if let Some(th) = intf.bgscan_threshold {
        conf.push_str(&format!("bgscan=\"simple:30:{}:300\"\n", th as i64));
    }
    conf.push_str("network={\n");
    let ssid = intf.ssid.as_deref().unwrap_or("default-ssid");
    conf.push_str(&format!("    ssid=\"{}\"\n", ssid));
    conf.push_str("    scan_ssid=1\n");
    match intf.encryption {
        Encryption::None => conf.push_str("    key_mgmt=NONE\n"),
        Encryption::Wep => {
            conf.push_str("    key_mgmt=NONE\n");
            if let Some(pass) = &intf.passphrase {
                conf.push_str(&format!("    wep_key0={}\n", pass));
            }
        }
        Encryption::Wpa | Encryption::Wpa2 => {
            conf.push_str("    key_mgmt=WPA-PSK\n");
            if let Some(pass) = &intf.passphrase {
                conf.push_str(&format!("    psk=\"{}\"\n", pass));
            }
        }
        Encryption::Wpa3 => {
            conf.push_str("    key_mgmt=SAE\n");
            conf.push_str("    ieee80211w=2\n");
            if let Some(pass) = &intf.passphrase {
                conf.push_str(&format!("    sae_password=\"{}\"\n", pass));
            }
        }
        Encryption::Dot1x => {
            conf.push_str("    key_mgmt=WPA-EAP\n");
            conf.push_str("    eap=PEAP\n");
            if let Some(identity) = &intf.identity {
                conf.push_str(&format!("    identity=\"{}\"\n", identity));
            }
            if let Some(pass) = &intf.passphrase {
                conf.push_str(&format!("    password=\"{}\"\n", pass));
            }
        }
    }
    conf.push_str("}\n");
    conf
}

/// The tc command sequence installing an htb + netem hierarchy on an
/// interface. Each element is one argv to run inside the owning
/// namespace.
pub fn tc_commands(ifname: &str, tc: &TcParams) -> Vec<Vec<String>> {
    let mut cmds = Vec::new();
    let s = |v: &str| v.to_string();

    // Root htb with a single default class carrying the rate limit.
    cmds.push(vec![
        s("tc"), s("qdisc"), s("replace"), s("dev"), s(ifname),
        s("root"), s("handle"), s("1:"), s("htb"), s("default"), s("10"),
    ]);
    let rate_kbit = tc.bw_mbps.map(|bw| (bw * 1000.0) as u64).unwrap_or(10_000_000);
    cmds.push(vec![
        s("tc"), s("class"), s("replace"), s("dev"), s(ifname),
        s("parent"), s("1:"), s("classid"), s("1:10"),
        s("htb"), s("rate"), format!("{}kbit", rate_kbit), s("ceil"), format!("{}kbit", rate_kbit),
    ]);

    let mut netem = vec![
        s("tc"), s("qdisc"), s("replace"), s("dev"), s(ifname),
        s("parent"), s("1:10"), s("handle"), s("10:"), s("netem"),
    ];
    if let Some(delay) = &tc.delay {
        netem.push(s("delay"));
        netem.push(delay.clone());
        if let Some(jitter) = &tc.jitter {
            netem.push(jitter.clone());
        }
    }
    if let Some(loss) = tc.loss_pct {
        if loss > 0.0 {
            netem.push(s("loss"));
            netem.push(format!("{}%", loss));
        }
    }
    if let Some(maxq) = tc.max_queue {
        netem.push(s("limit"));
        netem.push(maxq.to_string());
    }
    cmds.push(netem);
    cmds
}

/// The tc sequence mirroring an interface's ingress into an IFB device,
/// used when a shared master interface needs per-peer shaping.
pub fn ifb_redirect_commands(ifname: &str, ifb_index: u32) -> Vec<Vec<String>> {
    let ifb = format!("ifb{}", ifb_index);
    let s = |v: &str| v.to_string();
    vec![
        vec![s("ip"), s("link"), s("set"), s("dev"), ifb.clone(), s("up")],
        vec![
            s("tc"), s("qdisc"), s("replace"), s("dev"), s(ifname),
            s("handle"), s("ffff:"), s("ingress"),
        ],
        vec![
            s("tc"), s("filter"), s("replace"), s("dev"), s(ifname),
            s("parent"), s("ffff:"), s("protocol"), s("all"), s("u32"),
            s("match"), s("u32"), s("0"), s("0"),
            s("action"), s("mirred"), s("egress"), s("redirect"), s("dev"), ifb,
        ],
    ]
}

/// Remove the shaping hierarchy from an interface.
pub fn tc_teardown_commands(ifname: &str) -> Vec<Vec<String>> {
    let s = |v: &str| v.to_string();
    vec![vec![
        s("tc"), s("qdisc"), s("del"), s("dev"), s(ifname), s("root"),
    ]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wintf() -> WirelessIntf {
        let mut intf = WirelessIntf::new(NodeId(0), 0, "sta1-wlan0".into(), "02:00:00:00:00:01".into());
        intf.ssid = Some("ssid-1".into());
        intf
    }

    #[test]
    fn channel_frequencies() {
        assert!((channel_to_freq_ghz(1) - 2.412).abs() < 1e-9);
        assert!((channel_to_freq_ghz(6) - 2.437).abs() < 1e-9);
        assert!((channel_to_freq_ghz(14) - 2.484).abs() < 1e-9);
        assert!((channel_to_freq_ghz(36) - 5.180).abs() < 1e-9);
    }

    #[test]
    fn set_channel_tracks_frequency() {
        let mut intf = wintf();
        intf.set_channel(11);
        assert!((intf.freq_ghz - 2.462).abs() < 1e-9);
    }

    #[test]
    fn ap_conf_carries_ssid_channel_and_security() {
        let mut intf = wintf();
        intf.mode = WifiMode::Master;
        intf.encryption = Encryption::Wpa2;
        intf.passphrase = Some("secret-pass".into());
        intf.set_channel(6);
        let conf = ap_daemon_conf(&intf, "ap1", &ApDaemonOpts::default());
        assert!(conf.contains("ssid=ssid-1"));
        assert!(conf.contains("channel=6"));
        assert!(conf.contains("bridge=ap1"));
        assert!(conf.contains("wpa=2"));
        assert!(conf.contains("wpa_passphrase=secret-pass"));
    }

    #[test]
    fn ap_conf_80211r_and_isolation() {
        let mut intf = wintf();
        intf.mode = WifiMode::Master;
        let opts = ApDaemonOpts {
            mobility_domain: Some("a1b2".into()),
            client_isolation: true,
            ..Default::default()
        };
        let conf = ap_daemon_conf(&intf, "ap1", &opts);
        assert!(conf.contains("mobility_domain=a1b2"));
        assert!(conf.contains("ft_over_ds=1"));
        assert!(conf.contains("ap_isolate=1"));
    }

    #[test]
    fn supplicant_conf_open_and_psk() {
        let intf = wintf();
        let conf = supplicant_conf(&intf);
        assert!(conf.contains("ssid=\"ssid-1\""));
        assert!(conf.contains("key_mgmt=NONE"));

        let mut secured = wintf();
        secured.encryption = Encryption::Wpa2;
        secured.passphrase = Some("hunter22".into());
        secured.bgscan_threshold = Some(-60.0);
        let conf = supplicant_conf(&secured);
        assert!(conf.contains("psk=\"hunter22\""));
        assert!(conf.contains("bgscan=\"simple:30:-60:300\""));
    }

    #[test]
    fn tc_commands_build_htb_then_netem() {
        let tc = TcParams {
            bw_mbps: Some(10.0),
            delay: Some("5ms".into()),
            jitter: Some("1ms".into()),
            loss_pct: Some(2.0),
            max_queue: Some(100),
        };
        let cmds = tc_commands("sta1-wlan0", &tc);
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains(&"htb".to_string()));
        assert!(cmds[1].contains(&"10000kbit".to_string()));
        let netem = cmds[2].join(" ");
        assert!(netem.contains("netem delay 5ms 1ms loss 2% limit 100"));
    }

    #[test]
    fn mode_strings_round_trip() {
        for s in ["managed", "master", "adhoc", "mesh", "ibss", "4addr-client", "wifi-direct"] {
            let mode: WifiMode = s.parse().unwrap();
            assert_eq!(mode.to_string(), s);
        }
        assert!("repeater".parse::<WifiMode>().is_err());
    }
}
