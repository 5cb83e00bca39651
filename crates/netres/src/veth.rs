//! Virtual Ethernet (veth) pair driver
//!
//! Creates veth pairs over netlink, assigns MAC addresses and moves the
//! ends into node namespaces by sentinel pid. Creation deletes any
//! leftover interfaces with the same names first, so the call is
//! idempotent across crashed runs; a failure mid-sequence removes the
//! half-built pair before returning.

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::{new_connection, Handle};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum VethError {
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("Netlink operation failed: {0}")]
    Netlink(rtnetlink::Error),

    #[error("Interface '{0}' not found")]
    NotFound(String),

    #[error("Invalid interface name: {0}")]
    InvalidName(String),

    #[error("Invalid MAC address '{0}'")]
    InvalidMac(String),
}

/// Parse a colon-hex MAC string into raw bytes.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], VethError> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in out.iter_mut() {
        let part = parts.next().ok_or_else(|| VethError::InvalidMac(mac.to_string()))?;
        *byte = u8::from_str_radix(part, 16).map_err(|_| VethError::InvalidMac(mac.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(VethError::InvalidMac(mac.to_string()));
    }
    Ok(out)
}

/// Format raw MAC bytes as the canonical colon-hex string.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn valid_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('-')
}

/// One endpoint of a veth pair as requested by the orchestrator.
#[derive(Clone, Debug)]
pub struct VethEnd {
    pub name: String,
    pub mac: Option<String>,
    /// Sentinel pid of the destination namespace; `None` leaves the end
    /// in the default namespace.
    pub netns_pid: Option<u32>,
}

/// Netlink-backed veth driver for the default namespace.
pub struct VethDriver {
    handle: Handle,
}

impl VethDriver {
    pub async fn new() -> Result<Self, VethError> {
        let (connection, handle, _) = new_connection().map_err(VethError::Io)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Create a veth pair and place each end per its spec. The pair is
    /// fully removed if any step fails.
    pub async fn create_pair(&self, a: &VethEnd, b: &VethEnd) -> Result<(), VethError> {
        for end in [a, b] {
            if !valid_ifname(&end.name) {
                return Err(VethError::InvalidName(end.name.clone()));
            }
        }

        // Names are deleted before creation so a retry after a crash
        // does not trip over leftovers.
        self.delete_if_exists(&a.name).await?;
        self.delete_if_exists(&b.name).await?;

        debug!("Creating veth pair {} <-> {}", a.name, b.name);
        self.handle
            .link()
            .add()
            .veth(a.name.clone(), b.name.clone())
            .execute()
            .await
            .map_err(VethError::Netlink)?;

        match self.configure_pair(a, b).await {
            Ok(()) => {
                info!("Created veth pair {} <-> {}", a.name, b.name);
                Ok(())
            }
            Err(e) => {
                // Deleting either end tears down the whole pair.
                let _ = self.delete_if_exists(&a.name).await;
                let _ = self.delete_if_exists(&b.name).await;
                Err(e)
            }
        }
    }

    async fn configure_pair(&self, a: &VethEnd, b: &VethEnd) -> Result<(), VethError> {
        for end in [a, b] {
            let index = self.index_of(&end.name).await?;
            if let Some(mac) = &end.mac {
                let bytes = parse_mac(mac)?;
                self.handle
                    .link()
                    .set(index)
                    .address(bytes.to_vec())
                    .execute()
                    .await
                    .map_err(VethError::Netlink)?;
            }
            if let Some(pid) = end.netns_pid {
                self.handle
                    .link()
                    .set(index)
                    .setns_by_pid(pid)
                    .execute()
                    .await
                    .map_err(VethError::Netlink)?;
            }
        }
        Ok(())
    }

    /// Delete an interface if it exists in the default namespace.
    pub async fn delete_if_exists(&self, name: &str) -> Result<(), VethError> {
        match self.index_of(name).await {
            Ok(index) => {
                debug!("Deleting stale interface {}", name);
                self.handle
                    .link()
                    .del(index)
                    .execute()
                    .await
                    .map_err(VethError::Netlink)
            }
            Err(VethError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Bring an interface in the default namespace up.
    pub async fn set_up(&self, name: &str) -> Result<(), VethError> {
        let index = self.index_of(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(VethError::Netlink)
    }

    /// Add an address to an interface in the default namespace.
    pub async fn add_address(&self, name: &str, addr: IpNetwork) -> Result<(), VethError> {
        let index = self.index_of(name).await?;
        self.handle
            .address()
            .add(index, addr.ip(), addr.prefix())
            .execute()
            .await
            .map_err(VethError::Netlink)
    }

    async fn index_of(&self, name: &str) -> Result<u32, VethError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(VethError::NotFound(name.to_string())),
            // rtnetlink surfaces a missing name as an error reply.
            Err(_) => Err(VethError::NotFound(name.to_string())),
        }
    }
}
