//! Signal-to-rate lookup tables
//!
//! Maps a received signal level to the best attainable PHY rate for each
//! supported 802.11 mode. The table is embedded and materialized once at
//! startup; entries are (MCS-or-modulation index, minimum RSSI, rate).
//!
//! Selection picks the fastest entry whose sensitivity floor is satisfied;
//! when two entries carry the same rate the lower index wins.

use crate::RfModelError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IeeeMode {
    A,
    B,
    G,
    N,
    Ac,
    Ax,
    Be,
}

impl fmt::Display for IeeeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IeeeMode::A => "a",
            IeeeMode::B => "b",
            IeeeMode::G => "g",
            IeeeMode::N => "n",
            IeeeMode::Ac => "ac",
            IeeeMode::Ax => "ax",
            IeeeMode::Be => "be",
        };
        f.write_str(s)
    }
}

impl FromStr for IeeeMode {
    type Err = RfModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" => Ok(IeeeMode::A),
            "b" => Ok(IeeeMode::B),
            "g" => Ok(IeeeMode::G),
            "n" => Ok(IeeeMode::N),
            "ac" => Ok(IeeeMode::Ac),
            "ax" => Ok(IeeeMode::Ax),
            "be" => Ok(IeeeMode::Be),
            other => Err(RfModelError::UnknownIeeeMode(other.to_string())),
        }
    }
}

/// One row of the lookup table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateEntry {
    /// MCS index for HT/VHT/HE/EHT modes, modulation index for legacy.
    pub mcs: u8,
    /// Sensitivity floor in dBm for long guard interval.
    pub min_rssi_dbm: f64,
    /// Data rate in Mbps with long guard interval.
    pub rate_mbps: f64,
    /// Data rate in Mbps with short guard interval (equals `rate_mbps`
    /// for modes without a short GI option).
    pub rate_sgi_mbps: f64,
}

const fn e(mcs: u8, min_rssi_dbm: f64, rate_mbps: f64, rate_sgi_mbps: f64) -> RateEntry {
    RateEntry {
        mcs,
        min_rssi_dbm,
        rate_mbps,
        rate_sgi_mbps,
    }
}

// Legacy OFDM (802.11a, 5 GHz and 802.11g, 2.4 GHz share the rate set).
const OFDM_LEGACY: &[RateEntry] = &[
    e(0, -82.0, 6.0, 6.0),
    e(1, -81.0, 9.0, 9.0),
    e(2, -79.0, 12.0, 12.0),
    e(3, -77.0, 18.0, 18.0),
    e(4, -74.0, 24.0, 24.0),
    e(5, -70.0, 36.0, 36.0),
    e(6, -66.0, 48.0, 48.0),
    e(7, -65.0, 54.0, 54.0),
];

// 802.11b DSSS/CCK.
const DSSS_B: &[RateEntry] = &[
    e(0, -92.0, 1.0, 1.0),
    e(1, -89.0, 2.0, 2.0),
    e(2, -87.0, 5.5, 5.5),
    e(3, -85.0, 11.0, 11.0),
];

// 802.11n HT20, single stream.
const HT20: &[RateEntry] = &[
    e(0, -82.0, 6.5, 7.2),
    e(1, -79.0, 13.0, 14.4),
    e(2, -77.0, 19.5, 21.7),
    e(3, -74.0, 26.0, 28.9),
    e(4, -70.0, 39.0, 43.3),
    e(5, -66.0, 52.0, 57.8),
    e(6, -65.0, 58.5, 65.0),
    e(7, -64.0, 65.0, 72.2),
];

// 802.11ac VHT20, single stream.
const VHT20: &[RateEntry] = &[
    e(0, -82.0, 6.5, 7.2),
    e(1, -79.0, 13.0, 14.4),
    e(2, -77.0, 19.5, 21.7),
    e(3, -74.0, 26.0, 28.9),
    e(4, -70.0, 39.0, 43.3),
    e(5, -66.0, 52.0, 57.8),
    e(6, -65.0, 58.5, 65.0),
    e(7, -64.0, 65.0, 72.2),
    e(8, -59.0, 78.0, 86.7),
];

// 802.11ax HE20, single stream.
const HE20: &[RateEntry] = &[
    e(0, -82.0, 8.6, 8.6),
    e(1, -79.0, 17.2, 17.2),
    e(2, -77.0, 25.8, 25.8),
    e(3, -74.0, 34.4, 34.4),
    e(4, -70.0, 51.6, 51.6),
    e(5, -66.0, 68.8, 68.8),
    e(6, -65.0, 77.4, 77.4),
    e(7, -64.0, 86.0, 86.0),
    e(8, -59.0, 103.2, 103.2),
    e(9, -57.0, 114.7, 114.7),
    e(10, -54.0, 129.0, 129.0),
    e(11, -52.0, 143.4, 143.4),
];

// 802.11be EHT20, single stream.
const EHT20: &[RateEntry] = &[
    e(0, -82.0, 8.6, 8.6),
    e(1, -79.0, 17.2, 17.2),
    e(2, -77.0, 25.8, 25.8),
    e(3, -74.0, 34.4, 34.4),
    e(4, -70.0, 51.6, 51.6),
    e(5, -66.0, 68.8, 68.8),
    e(6, -65.0, 77.4, 77.4),
    e(7, -64.0, 86.0, 86.0),
    e(8, -59.0, 103.2, 103.2),
    e(9, -57.0, 114.7, 114.7),
    e(10, -54.0, 129.0, 129.0),
    e(11, -52.0, 143.4, 143.4),
    e(12, -49.0, 154.9, 154.9),
    e(13, -46.0, 172.1, 172.1),
];

/// The full lookup table for every mode.
#[derive(Clone, Debug)]
pub struct RateTable {
    by_mode: HashMap<IeeeMode, Vec<RateEntry>>,
}

static GLOBAL: Lazy<RateTable> = Lazy::new(RateTable::builtin);

impl RateTable {
    /// The embedded table, materialized on first use.
    pub fn global() -> &'static RateTable {
        &GLOBAL
    }

    pub fn builtin() -> Self {
        let mut by_mode = HashMap::new();
        by_mode.insert(IeeeMode::A, OFDM_LEGACY.to_vec());
        by_mode.insert(IeeeMode::B, DSSS_B.to_vec());
        by_mode.insert(IeeeMode::G, OFDM_LEGACY.to_vec());
        by_mode.insert(IeeeMode::N, HT20.to_vec());
        by_mode.insert(IeeeMode::Ac, VHT20.to_vec());
        by_mode.insert(IeeeMode::Ax, HE20.to_vec());
        by_mode.insert(IeeeMode::Be, EHT20.to_vec());
        Self { by_mode }
    }

    /// Parse an externally supplied table, e.g. a calibration override.
    /// The JSON shape is `{"n": [{"mcs":0,"min_rssi_dbm":-82.0,...}]}`.
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let by_mode: HashMap<IeeeMode, Vec<RateEntry>> = serde_json::from_str(s)?;
        Ok(Self { by_mode })
    }

    /// Whether the table carries any rows for `mode`. External tables
    /// loaded via [`from_json`](Self::from_json) may cover a subset of
    /// the modes; consumers fall back to exponent-4 range math for the
    /// rest.
    pub fn has_mode(&self, mode: IeeeMode) -> bool {
        self.by_mode
            .get(&mode)
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }

    /// Best entry for `mode` at the given signal level, or `None` when
    /// the signal is below every sensitivity floor.
    ///
    /// `legacy_ax` reroutes `ax` lookups through the legacy `n` table,
    /// preserving the original implementation's quirk for deployments
    /// that depend on it.
    pub fn rate_for(
        &self,
        mode: IeeeMode,
        short_gi: bool,
        rssi_dbm: f64,
        legacy_ax: bool,
    ) -> Option<RateEntry> {
        let mode = if legacy_ax && mode == IeeeMode::Ax {
            IeeeMode::N
        } else {
            mode
        };
        let entries = self.by_mode.get(&mode)?;
        let mut best: Option<RateEntry> = None;
        for entry in entries {
            if rssi_dbm < entry.min_rssi_dbm {
                continue;
            }
            let rate = if short_gi {
                entry.rate_sgi_mbps
            } else {
                entry.rate_mbps
            };
            match best {
                None => best = Some(*entry),
                Some(cur) => {
                    let cur_rate = if short_gi {
                        cur.rate_sgi_mbps
                    } else {
                        cur.rate_mbps
                    };
                    // Strictly faster wins; equal rate keeps the lower MCS.
                    if rate > cur_rate {
                        best = Some(*entry);
                    }
                }
            }
        }
        best
    }

    /// Top-of-table rate for a mode, used for link ceilings.
    pub fn max_rate_mbps(&self, mode: IeeeMode, short_gi: bool) -> Option<f64> {
        self.by_mode.get(&mode).and_then(|entries| {
            entries
                .iter()
                .map(|e| if short_gi { e.rate_sgi_mbps } else { e.rate_mbps })
                .fold(None, |acc: Option<f64>, r| {
                    Some(acc.map_or(r, |a| a.max(r)))
                })
        })
    }
}
