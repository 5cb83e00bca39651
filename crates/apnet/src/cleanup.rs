//! Cleanup registry
//!
//! Every externally visible mutation registers its inverse here *before*
//! the forward step runs, so a crash at any point leaves a replayable
//! log. Replay is LIFO, idempotent and concurrent-safe: missing state is
//! not an error, and a second drain finds an empty log and does nothing.
//!
//! The registry is injected wherever it is needed; there is no global
//! instance, and tests create a fresh one per case with a recording
//! executor.

use async_trait::async_trait;
use netres::docker::DockerDriver;
use netres::exec::CommandRunner;
use netres::ipt::{IptRule, IptablesDriver};
use netres::ovs::OvsDriver;
use netres::phy::PhyDriver;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One inverse action in the append-only log.
#[derive(Clone, Debug, PartialEq)]
pub enum CleanupAction {
    KillByPattern(String),
    RemoveKernelModule(String),
    RmFileGlob(String),
    FuserKillPort(u16),
    DeleteNetns(String),
    DeleteBridge(String),
    DockerRm(String),
    DetachIptablesRule { ns: Option<String>, rule: IptRule },
}

/// Applies individual actions. The engine uses [`HostExecutor`]; tests
/// substitute a recorder.
#[async_trait]
pub trait CleanupExecutor: Send + Sync {
    async fn apply(&self, action: &CleanupAction) -> Result<(), String>;
}

/// Append-only action log with a serialized drain.
#[derive(Default)]
pub struct CleanupRegistry {
    // Appends hold this only long enough to push.
    log: Mutex<Vec<CleanupAction>>,
    drain: tokio::sync::Mutex<()>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inverse. Call this before performing the forward step.
    pub fn record(&self, action: CleanupAction) {
        debug!("cleanup: recorded {:?}", action);
        self.log.lock().push(action);
    }

    /// Discard the most recent matching action, for operations that were
    /// cleanly reverted inline (e.g. a link removed while the topology
    /// keeps running).
    pub fn discharge(&self, action: &CleanupAction) {
        let mut log = self.log.lock();
        if let Some(pos) = log.iter().rposition(|a| a == action) {
            log.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    /// Replay the log LIFO through `executor`. Failed actions are logged
    /// and replay continues; the log is consumed either way. Concurrent
    /// callers serialize, and the loser of the race finds an empty log.
    pub async fn run(&self, executor: &dyn CleanupExecutor) -> usize {
        let _guard = self.drain.lock().await;
        let drained: Vec<CleanupAction> = {
            let mut log = self.log.lock();
            std::mem::take(&mut *log)
        };
        if drained.is_empty() {
            return 0;
        }
        info!("cleanup: replaying {} actions", drained.len());
        let mut applied = 0;
        for action in drained.iter().rev() {
            match executor.apply(action).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("CleanupError: {:?}: {}", action, e),
            }
        }
        applied
    }
}

/// Executor that mutates the host through the resource drivers.
pub struct HostExecutor {
    runner: CommandRunner,
    phy: PhyDriver,
    ovs: OvsDriver,
    ipt: IptablesDriver,
}

const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

impl HostExecutor {
    pub fn new() -> Self {
        Self {
            runner: CommandRunner::new(),
            phy: PhyDriver::new(),
            ovs: OvsDriver::new(),
            ipt: IptablesDriver::new(),
        }
    }

    async fn kill_pattern(&self, pattern: &str) -> Result<(), String> {
        // SIGTERM first, then SIGKILL for survivors a second later.
        let _ = self
            .runner
            .run_in(None, &["pkill", "-f", pattern], EXEC_TIMEOUT)
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = self
            .runner
            .run_in(None, &["pkill", "-9", "-f", pattern], EXEC_TIMEOUT)
            .await;
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> Result<(), String> {
        // Kill whatever still lives in the namespace (the sentinel at
        // minimum), then drop the bind entry.
        if let Ok(out) = self
            .runner
            .run_in(None, &["ip", "netns", "pids", name], EXEC_TIMEOUT)
            .await
        {
            for pid in out.stdout.split_whitespace() {
                let _ = self
                    .runner
                    .run_in(None, &["kill", "-9", pid], EXEC_TIMEOUT)
                    .await;
            }
        }
        let _ = self
            .runner
            .run_in(None, &["ip", "netns", "del", name], EXEC_TIMEOUT)
            .await;
        Ok(())
    }

    async fn rm_glob(&self, pattern: &str) -> Result<(), String> {
        // Globbing is confined to this helper; everything else execs
        // argv vectors without a shell.
        let cmd = format!("rm -f {}", pattern);
        let _ = self
            .runner
            .run_in(None, &["sh", "-c", &cmd], EXEC_TIMEOUT)
            .await;
        Ok(())
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CleanupExecutor for HostExecutor {
    async fn apply(&self, action: &CleanupAction) -> Result<(), String> {
        match action {
            CleanupAction::KillByPattern(pattern) => self.kill_pattern(pattern).await,
            CleanupAction::RemoveKernelModule(module) => {
                if *module == netres::phy::RADIO_MODULE {
                    self.phy.unload_module().await.map_err(|e| e.to_string())
                } else {
                    let _ = self
                        .runner
                        .run_in(None, &["rmmod", module], EXEC_TIMEOUT)
                        .await;
                    Ok(())
                }
            }
            CleanupAction::RmFileGlob(pattern) => self.rm_glob(pattern).await,
            CleanupAction::FuserKillPort(port) => {
                let spec = format!("{}/tcp", port);
                let _ = self
                    .runner
                    .run_in(None, &["fuser", "-k", &spec], EXEC_TIMEOUT)
                    .await;
                Ok(())
            }
            CleanupAction::DeleteNetns(name) => self.delete_netns(name).await,
            CleanupAction::DeleteBridge(name) => {
                self.ovs.del_bridge(name).await.map_err(|e| e.to_string())
            }
            CleanupAction::DockerRm(name) => match DockerDriver::connect() {
                Ok(docker) => docker.remove(name).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
            CleanupAction::DetachIptablesRule { ns, rule } => self
                .ipt
                .delete(ns.as_deref(), rule)
                .await
                .map_err(|e| e.to_string()),
        }
    }
}

/// Process names the engine may have spawned and must reap on teardown.
const ZOMBIE_PATTERNS: &[&str] = &[
    "ovs-testcontroller",
    "ovs-controller",
    "ofprotocol",
    "ofdatapath",
    "hostapd",
    "wpa_supplicant",
    "wmediumd",
];

/// Temporary files the engine scatters while running.
const TMP_GLOBS: &[&str] = &[
    "/tmp/vconn*",
    "/tmp/vlogs*",
    "/tmp/*.apconf",
    "/tmp/*.staconf",
    "/tmp/apnet-wmd-*",
];

/// The full host sweep: clears engine footprints even when no registry
/// survived (crash recovery). Safe to run twice; every step tolerates
/// absent state.
pub async fn sweep_host(executor: &HostExecutor, phy_prefixes: &[String]) {
    info!("cleanup: sweeping host state");

    // 1. Engine-owned containers.
    match DockerDriver::connect() {
        Ok(docker) => match docker.stop_and_remove_owned().await {
            Ok(n) if n > 0 => info!("cleanup: removed {} containers", n),
            Ok(_) => {}
            Err(e) => warn!("CleanupError: docker sweep: {}", e),
        },
        Err(e) => debug!("cleanup: docker unavailable ({}), skipping", e),
    }

    // 2. Known zombie processes.
    for pattern in ZOMBIE_PATTERNS {
        let _ = executor.kill_pattern(pattern).await;
    }

    // 3. Temporary files.
    for glob in TMP_GLOBS {
        let _ = executor.rm_glob(glob).await;
    }

    // 4. OVS datapaths, verified by re-enumeration.
    match executor.ovs.list_bridges().await {
        Ok(bridges) => {
            for bridge in &bridges {
                if let Err(e) = executor.ovs.del_bridge(bridge).await {
                    warn!("CleanupError: del-br {}: {}", bridge, e);
                }
            }
            if let Ok(leftover) = executor.ovs.list_bridges().await {
                for bridge in leftover {
                    let _ = executor.ovs.del_bridge(&bridge).await;
                }
            }
        }
        Err(e) => debug!("cleanup: ovs unavailable ({}), skipping", e),
    }

    // 5. Engine-owned phys.
    for prefix in phy_prefixes {
        if let Ok(phys) = executor.phy.list_phys(Some(prefix)).await {
            for phy in phys {
                let _ = executor.phy.destroy_phy(&phy).await;
            }
        }
    }
    if phy_prefixes.is_empty() {
        if let Ok(phys) = executor.phy.list_phys(None).await {
            for phy in phys {
                let _ = executor.phy.destroy_phy(&phy).await;
            }
        }
    }

    // 6. The radio driver itself.
    if let Err(e) = executor.phy.unload_module().await {
        warn!("CleanupError: module unload: {}", e);
    }

    info!("cleanup: sweep done");
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Arc;

    /// Records actions instead of touching the host.
    #[derive(Default)]
    pub struct RecordingExecutor {
        pub applied: Arc<Mutex<Vec<CleanupAction>>>,
        pub fail_on: Option<CleanupAction>,
    }

    #[async_trait]
    impl CleanupExecutor for RecordingExecutor {
        async fn apply(&self, action: &CleanupAction) -> Result<(), String> {
            if self.fail_on.as_ref() == Some(action) {
                return Err("injected failure".into());
            }
            self.applied.lock().push(action.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingExecutor;
    use super::*;

    #[tokio::test]
    async fn replay_is_lifo() {
        let registry = CleanupRegistry::new();
        registry.record(CleanupAction::DeleteNetns("sta1".into()));
        registry.record(CleanupAction::DeleteBridge("ap1".into()));
        registry.record(CleanupAction::RemoveKernelModule("aprf_drv".into()));

        let exec = RecordingExecutor::default();
        let applied = registry.run(&exec).await;
        assert_eq!(applied, 3);
        let order = exec.applied.lock().clone();
        assert_eq!(
            order,
            vec![
                CleanupAction::RemoveKernelModule("aprf_drv".into()),
                CleanupAction::DeleteBridge("ap1".into()),
                CleanupAction::DeleteNetns("sta1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn second_run_is_a_noop() {
        let registry = CleanupRegistry::new();
        registry.record(CleanupAction::FuserKillPort(12345));
        let exec = RecordingExecutor::default();
        assert_eq!(registry.run(&exec).await, 1);
        assert_eq!(registry.run(&exec).await, 0);
        assert_eq!(exec.applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_drain() {
        let registry = CleanupRegistry::new();
        registry.record(CleanupAction::DeleteNetns("sta1".into()));
        registry.record(CleanupAction::DeleteBridge("boom".into()));
        registry.record(CleanupAction::DeleteNetns("sta2".into()));

        let exec = RecordingExecutor {
            fail_on: Some(CleanupAction::DeleteBridge("boom".into())),
            ..Default::default()
        };
        let applied = registry.run(&exec).await;
        assert_eq!(applied, 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn discharge_removes_latest_match() {
        let registry = CleanupRegistry::new();
        let action = CleanupAction::DeleteBridge("ap1".into());
        registry.record(action.clone());
        registry.record(CleanupAction::DeleteNetns("sta1".into()));
        registry.discharge(&action);
        assert_eq!(registry.len(), 1);

        let exec = RecordingExecutor::default();
        registry.run(&exec).await;
        assert_eq!(
            exec.applied.lock().clone(),
            vec![CleanupAction::DeleteNetns("sta1".into())]
        );
    }

    #[tokio::test]
    async fn concurrent_drains_apply_each_action_once() {
        use std::sync::Arc;
        let registry = Arc::new(CleanupRegistry::new());
        for i in 0..16 {
            registry.record(CleanupAction::DeleteNetns(format!("ns{}", i)));
        }
        let exec = Arc::new(RecordingExecutor::default());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let exec = exec.clone();
            handles.push(tokio::spawn(async move { registry.run(&*exec).await }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 16);
        assert_eq!(exec.applied.lock().len(), 16);
    }
}
