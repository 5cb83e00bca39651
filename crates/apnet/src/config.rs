//! Engine configuration
//!
//! Everything that parameterizes a run: the IP base, wireless defaults,
//! the propagation setup, the wmediumd mode, association control and the
//! mobility seed. Validated once at the top of `build`.

use crate::EngineError;
use rfmodel::PropagationConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// How the RF daemon derives per-pair link quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WmediumdMode {
    /// Per-pair SNR computed from geometry and the propagation model.
    Interference,
    /// Caller-supplied per-pair loss probability; geometry is ignored.
    ErrorProb,
}

/// Association control policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcMethod {
    /// Strongest signal first.
    Ssf,
    /// Least loaded first.
    Llf,
    /// No automatic roaming.
    Manual,
}

impl FromStr for AcMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssf" => Ok(AcMethod::Ssf),
            "llf" => Ok(AcMethod::Llf),
            "manual" => Ok(AcMethod::Manual),
            other => Err(EngineError::Config(format!(
                "unknown association control method '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base network for automatic addressing, e.g. "10.0.0.0/8".
    pub ip_base: String,
    /// Default SSID for wireless interfaces that don't set one.
    pub ssid: String,
    /// Default channel.
    pub channel: u32,
    /// Default channel width in MHz (20/40/80/160).
    pub band_mhz: u32,
    /// Default IEEE 802.11 mode ("g", "n", ...).
    pub mode: String,
    /// RF daemon mode.
    pub wmediumd_mode: WmediumdMode,
    /// Propagation parameters.
    pub propagation: PropagationConfig,
    /// Drive first-time associations automatically after build.
    pub auto_association: bool,
    /// Association control policy.
    pub ac_method: AcMethod,
    /// Seed for the mobility RNG; runs with the same seed replay
    /// identically.
    pub seed: u64,
    /// Preserve the original rate-table quirk that resolves `ax`
    /// lookups through the legacy HT table.
    pub legacy_ax_rates: bool,
    /// Enable per-peer IFB shaping mirrors for shared master interfaces.
    pub ifb: bool,
    /// Keep stations attached to one AP from talking to each other.
    pub client_isolation: bool,
    /// Unix socket path for the wmediumd control channel.
    pub wmediumd_socket: PathBuf,
    /// Path to an out-of-tree radio module, loaded via insmod.
    pub alt_module: Option<PathBuf>,
    /// Optional TCP command server bind address.
    pub socket_server: Option<(String, u16)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ip_base: "10.0.0.0/8".into(),
            ssid: "default-ssid".into(),
            channel: 1,
            band_mhz: 20,
            mode: "g".into(),
            wmediumd_mode: WmediumdMode::Interference,
            propagation: PropagationConfig::default(),
            auto_association: true,
            ac_method: AcMethod::Ssf,
            seed: 0,
            legacy_ax_rates: false,
            ifb: false,
            client_isolation: false,
            wmediumd_socket: PathBuf::from("/tmp/apnet-wmediumd.sock"),
            alt_module: None,
            socket_server: None,
        }
    }
}

impl EngineConfig {
    /// Validate static configuration. Fatal to `build` on failure.
    pub fn validate(&self) -> Result<(), EngineError> {
        let (base, prefix) = parse_ip_base(&self.ip_base)?;
        if prefix > 30 {
            return Err(EngineError::Config(format!(
                "ip base prefix /{} leaves no room for hosts",
                prefix
            )));
        }
        let _ = base;
        if !matches!(self.band_mhz, 20 | 40 | 80 | 160) {
            return Err(EngineError::Config(format!(
                "unsupported channel width {} MHz",
                self.band_mhz
            )));
        }
        self.mode
            .parse::<rfmodel::IeeeMode>()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn ieee_mode(&self) -> rfmodel::IeeeMode {
        // validate() has vetted the string; fall back to g defensively
        // is not needed because build refuses invalid configs.
        self.mode.parse().unwrap_or(rfmodel::IeeeMode::G)
    }
}

/// Parse "a.b.c.d/len" into the numeric base and prefix length.
pub fn parse_ip_base(s: &str) -> Result<(u32, u8), EngineError> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| EngineError::Config(format!("bad ip base '{}': missing prefix", s)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| EngineError::Config(format!("bad ip base '{}': bad prefix", s)))?;
    if prefix > 32 {
        return Err(EngineError::Config(format!("bad ip base '{}': /{}", s, prefix)));
    }
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.len() != 4 {
        return Err(EngineError::Config(format!("bad ip base '{}'", s)));
    }
    let mut base: u32 = 0;
    for o in octets {
        let v: u8 = o
            .parse()
            .map_err(|_| EngineError::Config(format!("bad ip base '{}'", s)))?;
        base = (base << 8) | v as u32;
    }
    Ok((base, prefix))
}

/// The i-th automatically assigned address under a base, as dotted quad.
pub fn ip_add(i: u32, base: u32, prefix: u8) -> String {
    let host_bits = 32 - prefix as u32;
    let masked = if host_bits >= 32 { 0 } else { base >> host_bits << host_bits };
    let addr = masked | (i & ((1u64 << host_bits) as u32).wrapping_sub(1));
    format!(
        "{}.{}.{}.{}",
        addr >> 24,
        (addr >> 16) & 0xff,
        (addr >> 8) & 0xff,
        addr & 0xff
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_ip_base_is_a_config_error() {
        let mut cfg = EngineConfig::default();
        cfg.ip_base = "300.0.0.0/8".into();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
        cfg.ip_base = "10.0.0.0".into();
        assert!(cfg.validate().is_err());
        cfg.ip_base = "10.0.0.0/31".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_mode_is_a_config_error() {
        let mut cfg = EngineConfig::default();
        cfg.mode = "z".into();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.tag(), "ConfigError");
    }

    #[test]
    fn auto_addressing_counts_up_from_base() {
        let (base, prefix) = parse_ip_base("10.0.0.0/8").unwrap();
        assert_eq!(ip_add(1, base, prefix), "10.0.0.1");
        assert_eq!(ip_add(257, base, prefix), "10.0.1.1");
        let (base, prefix) = parse_ip_base("192.168.1.0/24").unwrap();
        assert_eq!(ip_add(5, base, prefix), "192.168.1.5");
    }

    #[test]
    fn ac_method_parses() {
        assert_eq!("ssf".parse::<AcMethod>().unwrap(), AcMethod::Ssf);
        assert_eq!("llf".parse::<AcMethod>().unwrap(), AcMethod::Llf);
        assert!("best".parse::<AcMethod>().is_err());
    }
}
