//! iptables NAT rule management
//!
//! Installs the masquerade and forward rules a NAT node needs. Each rule
//! is kept as an argv suffix; installation appends (`-A`), removal
//! deletes (`-D`) the exact same suffix, which gives cleanup a precise
//! inverse.

use crate::exec::{CommandRunner, ExecError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum IptablesError {
    #[error("iptables failed: {0}")]
    Exec(#[from] ExecError),
}

const IPT_TIMEOUT: Duration = Duration::from_secs(10);

/// One rule expressed as the argv suffix after the -A/-D flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IptRule {
    pub table: Option<String>,
    pub chain: String,
    pub args: Vec<String>,
}

impl IptRule {
    fn argv(&self, action: &str) -> Vec<String> {
        let mut argv = vec!["iptables".to_string()];
        if let Some(table) = &self.table {
            argv.push("-t".to_string());
            argv.push(table.clone());
        }
        argv.push(action.to_string());
        argv.push(self.chain.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// The rule set for one NAT node masquerading `subnet` out of
/// `ext_iface`, forwarding for `int_iface`.
pub fn nat_rules(subnet: &str, int_iface: &str, ext_iface: &str) -> Vec<IptRule> {
    vec![
        IptRule {
            table: Some("nat".into()),
            chain: "POSTROUTING".into(),
            args: vec![
                "-s".into(),
                subnet.into(),
                "!".into(),
                "-d".into(),
                subnet.into(),
                "-j".into(),
                "MASQUERADE".into(),
            ],
        },
        IptRule {
            table: None,
            chain: "FORWARD".into(),
            args: vec![
                "-i".into(),
                int_iface.into(),
                "-d".into(),
                subnet.into(),
                "-j".into(),
                "DROP".into(),
            ],
        },
        IptRule {
            table: None,
            chain: "FORWARD".into(),
            args: vec![
                "-i".into(),
                int_iface.into(),
                "-s".into(),
                subnet.into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        },
        IptRule {
            table: None,
            chain: "FORWARD".into(),
            args: vec![
                "-o".into(),
                ext_iface.into(),
                "-d".into(),
                subnet.into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        },
    ]
}

pub struct IptablesDriver {
    runner: CommandRunner,
}

impl IptablesDriver {
    pub fn new() -> Self {
        Self {
            runner: CommandRunner::new(),
        }
    }

    pub async fn append(&self, ns: Option<&str>, rule: &IptRule) -> Result<(), IptablesError> {
        let argv = rule.argv("-A");
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.runner.run_in_checked(ns, &argv, IPT_TIMEOUT).await?;
        info!("Installed iptables rule in {}: {:?}", ns.unwrap_or("host"), rule.chain);
        Ok(())
    }

    /// Delete a rule; an already-absent rule is not an error.
    pub async fn delete(&self, ns: Option<&str>, rule: &IptRule) -> Result<(), IptablesError> {
        let argv = rule.argv("-D");
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let out = self.runner.run_in(ns, &argv, IPT_TIMEOUT).await?;
        if !out.success() {
            debug!("iptables -D reported {} (rule may be gone)", out.code);
        }
        Ok(())
    }

    pub async fn enable_ip_forward(&self, ns: Option<&str>) -> Result<(), IptablesError> {
        self.runner
            .run_in_checked(ns, &["sysctl", "-w", "net.ipv4.ip_forward=1"], IPT_TIMEOUT)
            .await?;
        Ok(())
    }
}

impl Default for IptablesDriver {
    fn default() -> Self {
        Self::new()
    }
}
