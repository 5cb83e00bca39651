//! Resource driver for the access-point network emulator
//!
//! This crate is the only layer that mutates kernel or daemon state. It
//! wraps network namespaces (with a sleeping sentinel process per
//! namespace), veth pairs via netlink, virtual wireless phys through the
//! `aprf_ctrl` utility and the `aprf_drv` kernel module, Open vSwitch
//! bridges, iptables NAT rules, subprocess execution inside namespaces,
//! and Docker containers through the engine API on the local socket.
//!
//! Callers are expected to record an inverse action with their cleanup
//! registry *before* invoking any mutating operation here; the inverses
//! are all no-ops on absent state, which makes a crash between record
//! and perform safe.

pub mod docker;
pub mod exec;
pub mod ipt;
pub mod netns;
pub mod ovs;
pub mod phy;
pub mod veth;

pub use exec::{CommandRunner, ExecOutput};
pub use netns::NetnsManager;
pub use phy::PhyDriver;
pub use veth::VethDriver;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetresError {
    #[error("Network namespace error: {0}")]
    NetNs(#[from] netns::NetnsError),

    #[error("Veth interface error: {0}")]
    Veth(#[from] veth::VethError),

    #[error("Phy/radio driver error: {0}")]
    Phy(#[from] phy::PhyError),

    #[error("Command execution error: {0}")]
    Exec(#[from] exec::ExecError),

    #[error("Open vSwitch error: {0}")]
    Ovs(#[from] ovs::OvsError),

    #[error("iptables error: {0}")]
    Iptables(#[from] ipt::IptablesError),

    #[error("Docker error: {0}")]
    Docker(#[from] docker::DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
