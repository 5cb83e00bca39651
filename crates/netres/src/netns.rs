//! Network namespace management
//!
//! Each emulated node gets its own network namespace, held open by a
//! sleeping sentinel process. The sentinel's pid doubles as the node's
//! namespace leader: veth ends and phys are moved by pid, and commands
//! run via `ip netns exec` against the bind-published
//! `/var/run/netns/<name>` entry.

use nix::mount::{mount, umount, MsFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetnsError {
    #[error("Failed to create netns directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to create netns file: {0}")]
    CreateFile(std::io::Error),

    #[error("Failed to spawn sentinel process: {0}")]
    Sentinel(std::io::Error),

    #[error("Sentinel for '{0}' exited before the namespace was published")]
    SentinelDied(String),

    #[error("Failed to mount namespace: {0}")]
    Mount(nix::Error),

    #[error("Namespace '{0}' not found")]
    NotFound(String),

    #[error("Namespace '{0}' already exists")]
    AlreadyExists(String),

    #[error("Insufficient permissions (CAP_NET_ADMIN required)")]
    Permission,
}

struct Sentinel {
    child: Child,
    pid: u32,
}

/// Network namespace manager keyed by node name.
pub struct NetnsManager {
    sentinels: HashMap<String, Sentinel>,
    base_dir: PathBuf,
}

impl NetnsManager {
    pub fn new() -> Result<Self, NetnsError> {
        let base_dir = PathBuf::from("/var/run/netns");
        std::fs::create_dir_all(&base_dir).map_err(NetnsError::CreateDir)?;
        Ok(Self {
            sentinels: HashMap::new(),
            base_dir,
        })
    }

    pub fn base_dir_path(&self) -> &Path {
        &self.base_dir
    }

    /// Create a namespace named `name`, returning the pid of its
    /// sentinel process. Fails if the name collides with a live
    /// namespace or a stale `/var/run/netns` entry.
    pub async fn create(&mut self, name: &str) -> Result<u32, NetnsError> {
        if self.sentinels.contains_key(name) {
            return Err(NetnsError::AlreadyExists(name.to_string()));
        }
        let ns_path = self.base_dir.join(name);
        if ns_path.exists() {
            return Err(NetnsError::AlreadyExists(name.to_string()));
        }

        debug!("Creating namespace {} with sentinel", name);

        // The sentinel unshares its network namespace before exec and
        // then sleeps until we kill it.
        let mut cmd = Command::new("sleep");
        cmd.arg("infinity")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        unsafe {
            cmd.pre_exec(|| {
                nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNET)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }
        let child = cmd.spawn().map_err(NetnsError::Sentinel)?;
        let pid = child.id().ok_or_else(|| NetnsError::SentinelDied(name.to_string()))?;

        // Publish the namespace under /var/run/netns so external tools
        // (ip, tc, iw) can address it by name.
        fs::File::create(&ns_path).await.map_err(NetnsError::CreateFile)?;
        let proc_ns = format!("/proc/{}/ns/net", pid);
        if let Err(e) = mount(
            Some(proc_ns.as_str()),
            &ns_path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            let _ = fs::remove_file(&ns_path).await;
            let mut child = child;
            let _ = child.kill().await;
            return Err(match e {
                nix::Error::EPERM => NetnsError::Permission,
                other => NetnsError::Mount(other),
            });
        }

        self.sentinels.insert(name.to_string(), Sentinel { child, pid });
        info!("Created namespace {} (sentinel pid {})", name, pid);
        Ok(pid)
    }

    /// Pid of the sentinel for `name`.
    pub fn pid_of(&self, name: &str) -> Result<u32, NetnsError> {
        self.sentinels
            .get(name)
            .map(|s| s.pid)
            .ok_or_else(|| NetnsError::NotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.sentinels.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.sentinels.keys().cloned().collect()
    }

    /// Delete a namespace: kill the sentinel, unmount and remove the
    /// bind entry. Missing state is not an error.
    pub async fn delete(&mut self, name: &str) -> Result<(), NetnsError> {
        if let Some(mut sentinel) = self.sentinels.remove(name) {
            let _ = kill(Pid::from_raw(sentinel.pid as i32), Signal::SIGTERM);
            let _ = sentinel.child.kill().await;
            let _ = sentinel.child.wait().await;
        }

        let ns_path = self.base_dir.join(name);
        if ns_path.exists() {
            if let Err(e) = umount(&ns_path) {
                debug!("Unmount of namespace {} failed: {} (may be unmounted)", name, e);
            }
            if let Err(e) = fs::remove_file(&ns_path).await {
                warn!("Failed to remove namespace file {}: {}", name, e);
            }
            info!("Deleted namespace {}", name);
        }
        Ok(())
    }

    /// Remove every `/var/run/netns` entry matching `prefix`, including
    /// stale ones from a previous crashed run. Returns the number of
    /// entries removed.
    pub async fn force_cleanup_prefix(&mut self, prefix: &str) -> Result<usize, NetnsError> {
        let mut cleaned = 0;
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        for name in names {
            self.delete(&name).await?;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

impl Drop for NetnsManager {
    fn drop(&mut self) {
        // Sentinels carry kill_on_drop; the bind entries are left for the
        // cleanup registry, which owns teardown ordering.
        if !self.sentinels.is_empty() {
            debug!("Dropping netns manager with {} live sentinels", self.sentinels.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn create_and_delete_namespace() -> Result<(), NetnsError> {
        let mut mgr = NetnsManager::new()?;
        let pid = mgr.create("apnet-test-ns").await?;
        assert!(pid > 0);
        assert!(mgr.exists("apnet-test-ns"));
        assert!(mgr.create("apnet-test-ns").await.is_err());
        mgr.delete("apnet-test-ns").await?;
        assert!(!mgr.exists("apnet-test-ns"));
        // Second delete is a no-op.
        mgr.delete("apnet-test-ns").await?;
        Ok(())
    }

    #[test]
    fn pid_of_unknown_namespace_errors() {
        let mgr = NetnsManager {
            sentinels: HashMap::new(),
            base_dir: PathBuf::from("/nonexistent"),
        };
        assert!(matches!(mgr.pid_of("ghost"), Err(NetnsError::NotFound(_))));
    }
}
