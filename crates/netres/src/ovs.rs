//! Open vSwitch bridge driver
//!
//! Thin `ovs-vsctl` wrapper used for AP bridges and kernel switches.
//! Deletion uses `--if-exists` semantics throughout so cleanup can
//! replay blindly.

use crate::exec::{CommandRunner, ExecError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum OvsError {
    #[error("ovs-vsctl failed: {0}")]
    Exec(#[from] ExecError),
}

const VSCTL_TIMEOUT: Duration = Duration::from_secs(10);

/// sFlow attachment parameters, read from COLLECTOR/SAMPLING/POLLING.
#[derive(Clone, Debug)]
pub struct SflowParams {
    pub collector: String,
    pub sampling: u32,
    pub polling: u32,
}

impl SflowParams {
    /// Build from the environment; `None` when no collector is set.
    pub fn from_env() -> Option<Self> {
        let collector = std::env::var("COLLECTOR").ok()?;
        let sampling = std::env::var("SAMPLING")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let polling = std::env::var("POLLING")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        Some(Self {
            collector,
            sampling,
            polling,
        })
    }
}

pub struct OvsDriver {
    runner: CommandRunner,
}

impl OvsDriver {
    pub fn new() -> Self {
        Self {
            runner: CommandRunner::new(),
        }
    }

    pub async fn add_bridge(&self, name: &str) -> Result<(), OvsError> {
        self.runner
            .run_in_checked(
                None,
                &["ovs-vsctl", "--may-exist", "add-br", name],
                VSCTL_TIMEOUT,
            )
            .await?;
        info!("Created OVS bridge {}", name);
        Ok(())
    }

    pub async fn del_bridge(&self, name: &str) -> Result<(), OvsError> {
        self.runner
            .run_in_checked(
                None,
                &["ovs-vsctl", "--if-exists", "del-br", name],
                VSCTL_TIMEOUT,
            )
            .await?;
        debug!("Deleted OVS bridge {}", name);
        Ok(())
    }

    pub async fn add_port(&self, bridge: &str, port: &str) -> Result<(), OvsError> {
        self.runner
            .run_in_checked(
                None,
                &["ovs-vsctl", "--may-exist", "add-port", bridge, port],
                VSCTL_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// Point the bridge at its OpenFlow controllers.
    pub async fn set_controllers(&self, bridge: &str, targets: &[String]) -> Result<(), OvsError> {
        let mut argv: Vec<&str> = vec!["ovs-vsctl", "set-controller", bridge];
        for t in targets {
            argv.push(t.as_str());
        }
        self.runner
            .run_in_checked(None, &argv, VSCTL_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn set_fail_mode(&self, bridge: &str, mode: &str) -> Result<(), OvsError> {
        self.runner
            .run_in_checked(
                None,
                &["ovs-vsctl", "set-fail-mode", bridge, mode],
                VSCTL_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn set_openflow_protocols(&self, bridge: &str, protocols: &str) -> Result<(), OvsError> {
        let value = format!("protocols={}", protocols);
        self.runner
            .run_in_checked(
                None,
                &["ovs-vsctl", "set", "bridge", bridge, &value],
                VSCTL_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// Bridges currently known to the local ovsdb.
    pub async fn list_bridges(&self) -> Result<Vec<String>, OvsError> {
        let out = self
            .runner
            .run_in(
                None,
                &["ovs-vsctl", "--timeout=1", "list-br"],
                VSCTL_TIMEOUT,
            )
            .await?;
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Whether the bridge reports a connected controller.
    pub async fn is_connected(&self, bridge: &str) -> Result<bool, OvsError> {
        let out = self
            .runner
            .run_in(
                None,
                &["ovs-vsctl", "get", "controller", bridge, "is_connected"],
                VSCTL_TIMEOUT,
            )
            .await?;
        Ok(out.success() && out.stdout.contains("true"))
    }

    /// Attach an sFlow agent to the bridge.
    pub async fn enable_sflow(&self, bridge: &str, params: &SflowParams) -> Result<(), OvsError> {
        let target = format!("target=\"{}\"", params.collector);
        let sampling = format!("sampling={}", params.sampling);
        let polling = format!("polling={}", params.polling);
        let argv = [
            "ovs-vsctl",
            "--",
            "--id=@s",
            "create",
            "sflow",
            target.as_str(),
            sampling.as_str(),
            polling.as_str(),
            "--",
            "set",
            "bridge",
            bridge,
            "sflow=@s",
        ];
        self.runner
            .run_in_checked(None, &argv, VSCTL_TIMEOUT)
            .await?;
        info!("Enabled sFlow on {} -> {}", bridge, params.collector);
        Ok(())
    }
}

impl Default for OvsDriver {
    fn default() -> Self {
        Self::new()
    }
}
