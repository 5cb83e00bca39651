//! Virtual radio (phy) driver
//!
//! Talks to the `aprf_drv` kernel module and its `aprf_ctrl` control
//! utility. Phys can be created statically at module load time
//! (`radios=<n>`) or registered on the fly per node, which is what makes
//! live `add_sta`/`add_ap` possible without reloading the driver.
//!
//! Module load/unload and static radio creation are global kernel
//! operations and are serialized process-wide.

use crate::exec::{CommandRunner, ExecError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PhyError {
    #[error("Command failed: {0}")]
    Exec(#[from] ExecError),

    #[error("aprf_ctrl produced no parseable id (stdout: {0:?})")]
    NoId(String),

    #[error("Could not move phy '{0}' into netns of pid {1}: {2}")]
    MoveFailed(String, u32, String),

    #[error("Radio module is not loaded")]
    ModuleNotLoaded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub const RADIO_MODULE: &str = "aprf_drv";
const CTRL_UTILITY: &str = "aprf_ctrl";
const DEBUGFS_ROOT: &str = "/sys/kernel/debug/ieee80211";
/// Marker file the radio driver exposes under each of its phys.
const PHY_MARKER: &str = "wemu";

const MOVE_RETRIES: usize = 3;
const MOVE_RETRY_DELAY: Duration = Duration::from_millis(1);
const CTRL_TIMEOUT: Duration = Duration::from_secs(10);

/// Driver for the virtual radio module and its phys.
pub struct PhyDriver {
    runner: CommandRunner,
    /// Serializes modprobe/insmod/rmmod and static radio creation.
    module_lock: Mutex<()>,
    debugfs_root: PathBuf,
}

impl PhyDriver {
    pub fn new() -> Self {
        Self {
            runner: CommandRunner::new(),
            module_lock: Mutex::new(()),
            debugfs_root: PathBuf::from(DEBUGFS_ROOT),
        }
    }

    #[cfg(test)]
    fn with_debugfs_root(root: &Path) -> Self {
        Self {
            runner: CommandRunner::new(),
            module_lock: Mutex::new(()),
            debugfs_root: root.to_path_buf(),
        }
    }

    /// Load mac80211 plus the radio driver with `radios` static radios.
    /// `alt_module` selects an out-of-tree build loaded via insmod.
    pub async fn load_module(
        &self,
        radios: u32,
        alt_module: Option<&Path>,
    ) -> Result<(), PhyError> {
        let _guard = self.module_lock.lock().await;
        self.runner
            .run_host(&["modprobe", "mac80211"])
            .await?;
        let radios_arg = format!("radios={}", radios);
        match alt_module {
            Some(path) => {
                let path = path.to_string_lossy();
                debug!("Loading alternative radio module {}", path);
                self.runner
                    .run_in_checked(None, &["insmod", &path, &radios_arg], CTRL_TIMEOUT)
                    .await?;
            }
            None => {
                self.runner
                    .run_in_checked(None, &["modprobe", RADIO_MODULE, &radios_arg], CTRL_TIMEOUT)
                    .await?;
            }
        }
        info!("Loaded {} with {} static radios", RADIO_MODULE, radios);
        Ok(())
    }

    /// Whether the radio module is currently loaded.
    pub async fn module_loaded(&self) -> bool {
        match tokio::fs::read_to_string("/proc/modules").await {
            Ok(modules) => modules
                .lines()
                .any(|l| l.split_whitespace().next() == Some(RADIO_MODULE)),
            Err(_) => false,
        }
    }

    /// Unload the radio module if loaded; a missing module is not an
    /// error.
    pub async fn unload_module(&self) -> Result<(), PhyError> {
        let _guard = self.module_lock.lock().await;
        if !self.module_loaded().await {
            return Ok(());
        }
        info!("Removing module {}", RADIO_MODULE);
        self.runner
            .run_in_checked(None, &["rmmod", RADIO_MODULE], CTRL_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Load the IFB module with `numifbs` mirrors for per-peer shaping.
    pub async fn load_ifb(&self, numifbs: u32) -> Result<(), PhyError> {
        let _guard = self.module_lock.lock().await;
        let arg = format!("numifbs={}", numifbs);
        self.runner
            .run_in_checked(None, &["modprobe", "ifb", &arg], CTRL_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Register a fresh virtual phy named after `prefix`. Returns the
    /// numeric id reported by the utility and the device name.
    pub async fn register_phy(&self, prefix: &str) -> Result<(u32, String), PhyError> {
        let out = self
            .runner
            .run_in_checked(None, &[CTRL_UTILITY, "-c", "-t", "-n", prefix], CTRL_TIMEOUT)
            .await?;
        let id = parse_ctrl_id(&out.stdout).ok_or_else(|| PhyError::NoId(out.stdout.clone()))?;
        debug!("Registered phy {} (id {})", prefix, id);
        Ok((id, prefix.to_string()))
    }

    /// Destroy a phy previously registered through the utility.
    pub async fn destroy_phy(&self, phy: &str) -> Result<(), PhyError> {
        let out = self
            .runner
            .run_in(None, &[CTRL_UTILITY, "-x", phy], CTRL_TIMEOUT)
            .await?;
        if !out.success() {
            debug!("Destroy of phy {} reported {} (may be gone)", phy, out.code);
        }
        Ok(())
    }

    /// All engine-owned phys, i.e. debugfs entries carrying the radio
    /// driver's marker, optionally filtered by name prefix. Sorted
    /// shortest-first to match creation order.
    pub async fn list_phys(&self, prefix: Option<&str>) -> Result<Vec<String>, PhyError> {
        let mut phys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.debugfs_root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(phys),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !entry.path().join(PHY_MARKER).exists() {
                continue;
            }
            if let Some(prefix) = prefix {
                if !name.starts_with(prefix) {
                    continue;
                }
            }
            phys.push(name);
        }
        phys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        Ok(phys)
    }

    /// Move a phy into the namespace led by `pid`. The kernel
    /// occasionally reports EBUSY right after module load, so the move
    /// is retried a bounded number of times.
    pub async fn move_phy_to_netns(&self, phy: &str, pid: u32) -> Result<(), PhyError> {
        let pid_str = pid.to_string();
        let mut last_stderr = String::new();
        for attempt in 0..MOVE_RETRIES {
            let out = self
                .runner
                .run_in(None, &["iw", "phy", phy, "set", "netns", &pid_str], CTRL_TIMEOUT)
                .await?;
            if out.success() {
                if attempt > 0 {
                    debug!("Moved phy {} on attempt {}", phy, attempt + 1);
                }
                return Ok(());
            }
            last_stderr = out.stderr.trim().to_string();
            tokio::time::sleep(MOVE_RETRY_DELAY).await;
        }
        Err(PhyError::MoveFailed(phy.to_string(), pid, last_stderr))
    }

    /// Lift the rfkill soft-block from a phy, matching it by name in the
    /// `rfkill list` output.
    pub async fn rfkill_unblock(&self, phy: &str) -> Result<(), PhyError> {
        let out = self.runner.run_in(None, &["rfkill", "list"], CTRL_TIMEOUT).await?;
        if let Some(idx) = parse_rfkill_index(&out.stdout, phy) {
            let idx = idx.to_string();
            let out = self
                .runner
                .run_in(None, &["rfkill", "unblock", &idx], CTRL_TIMEOUT)
                .await?;
            if !out.success() {
                warn!("rfkill unblock {} failed: {}", idx, out.stderr.trim());
            }
        }
        Ok(())
    }
}

impl Default for PhyDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the id from the utility's `ID <n>` success line.
fn parse_ctrl_id(stdout: &str) -> Option<u32> {
    for line in stdout.lines() {
        if let Some(rest) = line.trim().strip_prefix("ID ") {
            if let Ok(id) = rest.trim().parse::<u32>() {
                return Some(id);
            }
        }
    }
    None
}

/// Find the rfkill index for a phy in `rfkill list` output, whose
/// relevant lines look like `0: phy0: Wireless LAN`.
fn parse_rfkill_index(output: &str, phy: &str) -> Option<u32> {
    for line in output.lines() {
        let mut parts = line.splitn(3, ':');
        let idx = parts.next()?.trim();
        let name = parts.next()?.trim();
        if name == phy {
            if let Ok(idx) = idx.parse::<u32>() {
                return Some(idx);
            }
        }
    }
    None
}
