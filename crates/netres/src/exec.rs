//! Subprocess execution inside node namespaces
//!
//! Commands run as argv vectors without a shell. Invocations against the
//! same target (node namespace or host) are serialized through a
//! per-target lock so concurrent engine tasks cannot interleave their
//! `ip`/`iw`/`tc` calls on one node; distinct targets run concurrently.
//! Stdout is consumed line-wise and echoed at debug level while the
//! process runs.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),

    #[error("'{argv}' exited with status {code}: {stderr}")]
    NonZero {
        argv: String,
        code: i32,
        stderr: String,
    },

    #[error("'{0}' timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Empty argv")]
    EmptyArgv,
}

/// Captured result of a finished subprocess.
#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Serializing subprocess runner.
#[derive(Default)]
pub struct CommandRunner {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, target: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `argv` on the host, serialized against other host commands.
    pub async fn run_host(&self, argv: &[&str]) -> Result<ExecOutput, ExecError> {
        self.run_in(None, argv, DEFAULT_TIMEOUT).await
    }

    /// Run `argv` inside the namespace `ns` (or the host when `None`),
    /// serialized per target, bounded by `timeout`.
    pub async fn run_in(
        &self,
        ns: Option<&str>,
        argv: &[&str],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        if argv.is_empty() {
            return Err(ExecError::EmptyArgv);
        }
        let target = ns.unwrap_or("host").to_string();
        let lock = self.lock_for(&target).await;
        let _guard = lock.lock().await;
        run_once(ns, argv, timeout).await
    }

    /// Like [`run_in`](Self::run_in) but a non-zero exit becomes an
    /// error carrying the captured stderr.
    pub async fn run_in_checked(
        &self,
        ns: Option<&str>,
        argv: &[&str],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let out = self.run_in(ns, argv, timeout).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(ExecError::NonZero {
                argv: argv.join(" "),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

async fn run_once(
    ns: Option<&str>,
    argv: &[&str],
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    let cmd_display = argv.join(" ");
    let mut cmd = match ns {
        Some(ns) => {
            let mut c = Command::new("ip");
            c.args(["netns", "exec", ns]);
            c.args(argv);
            c
        }
        None => {
            let mut c = Command::new(argv[0]);
            c.args(&argv[1..]);
            c
        }
    };
    debug!(target = ns.unwrap_or("host"), "exec: {}", cmd_display);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::Spawn(cmd_display.clone(), e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = tokio::spawn(async move {
        let mut collected = String::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("  | {}", line);
                collected.push_str(&line);
                collected.push('\n');
            }
        }
        collected
    });

    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut collected).await;
        }
        collected
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(ExecError::Spawn(cmd_display, e)),
        Err(_) => {
            warn!("Command timed out, killing: {}", cmd_display);
            let _ = child.kill().await;
            return Err(ExecError::Timeout(cmd_display, timeout));
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    Ok(ExecOutput {
        stdout,
        stderr,
        code: status.code().unwrap_or(-1),
    })
}
