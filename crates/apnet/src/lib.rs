//! Access-point network emulation engine
//!
//! Materializes stations and access points as network namespaces joined
//! by virtual wireless radios, keeps the RF world (signal strength,
//! interference, error probability) consistent with node positions
//! through the wmediumd daemon, and layers an SDN network of OpenFlow
//! switches, controllers, hosts and NAT on top.
//!
//! The engine is a single process that owns the host: one writer task
//! owns the topology, long-running loops (mobility, the socket server)
//! publish commands into its mailbox, and every externally visible
//! allocation registers its inverse with the cleanup registry before it
//! is performed.

pub mod assoc;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod intf;
pub mod link;
pub mod mobility;
pub mod node;
pub mod persist;
pub mod server;
pub mod topology;
pub mod wmediumd;

pub use config::EngineConfig;
pub use engine::Engine;
pub use topology::{IntfId, NodeId, Topology};

use thiserror::Error;

/// Engine-wide error taxonomy. Every user-visible error carries its
/// short tag plus a line suitable for CLI display.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid topology: duplicate names, bad IP base, unknown mode.
    /// Fatal to `build`.
    #[error("ConfigError: {0}")]
    Config(String),

    /// The kernel or a daemon refused an operation. Recoverable only by
    /// teardown.
    #[error("ResourceError: {0}")]
    Resource(#[from] netres::NetresError),

    /// The RF daemon connection failed or refused a message.
    #[error("ResourceError: {0}")]
    Rf(#[from] wmediumd::WmediumdError),

    /// A subprocess exited non-zero or could not be found.
    #[error("ExternalToolError: {0}")]
    ExternalTool(String),

    /// Runtime failure during roaming/association. Never fatal to the
    /// topology.
    #[error("AssociationError: {0}")]
    Association(String),

    /// Numeric overflow or NaN out of the propagation model.
    #[error("PropagationInconsistency: {0}")]
    Propagation(String),

    /// An inverse action failed during teardown.
    #[error("CleanupError: {0}")]
    Cleanup(String),
}

impl EngineError {
    /// The taxonomy tag, e.g. for structured CLI output.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "ConfigError",
            EngineError::Resource(_) | EngineError::Rf(_) => "ResourceError",
            EngineError::ExternalTool(_) => "ExternalToolError",
            EngineError::Association(_) => "AssociationError",
            EngineError::Propagation(_) => "PropagationInconsistency",
            EngineError::Cleanup(_) => "CleanupError",
        }
    }
}

impl From<netres::exec::ExecError> for EngineError {
    fn from(e: netres::exec::ExecError) -> Self {
        EngineError::ExternalTool(e.to_string())
    }
}
