//! Radio propagation models and 802.11 data-rate tables
//!
//! This crate holds the pure math of the emulator: path-loss models that
//! turn node positions into per-pair RSSI/SNR values, the inverse
//! computation that derives an interface's usable range from its transmit
//! parameters, and the signal-to-rate lookup tables for the supported
//! 802.11 modes.
//!
//! Nothing in here touches the kernel or spawns processes; everything is
//! deterministic given its inputs, which is what makes seeded emulation
//! runs reproducible.

pub mod position;
pub mod propagation;
pub mod rates;

pub use position::Position;
pub use propagation::{PropagationConfig, PropagationModel, RadioSpec};
pub use rates::{IeeeMode, RateEntry, RateTable};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RfModelError {
    #[error("Invalid position string '{0}' (expected \"x,y,z\")")]
    InvalidPosition(String),

    #[error("Unknown propagation model '{0}'")]
    UnknownModel(String),

    #[error("Unknown IEEE 802.11 mode '{0}'")]
    UnknownIeeeMode(String),

    #[error("Propagation produced a non-finite value for {0}")]
    NonFinite(&'static str),
}
