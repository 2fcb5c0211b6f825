//! Process Manager - Subprocesses Bound to Environments
//!
//! Every workload process is spawned through tokio, tracked under an id,
//! and reaped by a background task that owns the child.  Callers interact
//! through a [`ProcessHandle`]: waiting never kills, stopping escalates from
//! a graceful signal to a forced one once the grace period runs out.
//!
//! # Design:
//! - The reaper task owns the `Child`; exit status is broadcast on a
//!   `watch` channel so any number of waiters can observe it
//! - Signals go to the process group when the process leads one, so
//!   helpers forked by the workload are terminated with it
//! - stdout/stderr are captured into shared buffers as they arrive
//! - Exited processes stay queryable until their owner evicts them with
//!   [`ProcessManager::retain_running`] or [`ProcessManager::forget`]

use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{IsolationError, Result};

/// How long the reaper waits for output pipes to drain after exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on waiting for a SIGKILLed process to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What to run and in which context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting the parent's.
    pub clear_env: bool,
    /// Make the child the leader of a new process group.
    pub new_process_group: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Reference to a tracked subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: u64,
    pub pid: u32,
    pub env_id: String,
    pub program: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(ExitInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

struct TrackedProcess {
    handle: ProcessHandle,
    group_leader: bool,
    exit: watch::Receiver<Option<ExitInfo>>,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl TrackedProcess {
    fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let pid = Pid::from_raw(self.handle.pid as i32);
        let sent = if self.group_leader {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        match sent {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(IsolationError::engine(
                &self.handle.env_id,
                "signal_process",
                anyhow::anyhow!("failed to send {signal} to pid {}: {errno}", self.handle.pid),
            )),
        }
    }
}

/// Registry of live and recently exited subprocesses.
pub struct ProcessManager {
    processes: RwLock<HashMap<u64, Arc<TrackedProcess>>>,
    next_id: AtomicU64,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn `spec` on behalf of `env_id`.
    pub fn spawn(&self, env_id: &str, spec: &CommandSpec) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if spec.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);
        if spec.new_process_group {
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", spec.program))
            .map_err(|e| IsolationError::engine(env_id, "spawn_process", e))?;
        let pid = child.id().ok_or_else(|| {
            IsolationError::engine(
                env_id,
                "spawn_process",
                anyhow::anyhow!("'{}' exited before its pid was observed", spec.program),
            )
        })?;

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(capture(out, Arc::clone(&stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(capture(err, Arc::clone(&stderr)));
        }

        let (tx, rx) = watch::channel(None);
        let reaper_env = env_id.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
            }
            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    warn!(env_id = %reaper_env, pid, error = %e, "Failed to reap process");
                    ExitInfo::default()
                }
            };
            debug!(env_id = %reaper_env, pid, exit = ?info, "Process exited");
            let _ = tx.send(Some(info));
        });

        let handle = ProcessHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pid,
            env_id: env_id.to_string(),
            program: spec.program.clone(),
        };
        info!(env_id, pid, program = %spec.program, "Spawned process");

        let tracked = Arc::new(TrackedProcess {
            handle: handle.clone(),
            group_leader: spec.new_process_group,
            exit: rx,
            stdout,
            stderr,
        });
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id, tracked);
        Ok(handle)
    }

    /// Block up to `timeout` for the process to exit.  On timeout the
    /// process is left running and a `Timeout` error is returned.
    pub async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> Result<ExitInfo> {
        let tracked = self.tracked(handle)?;
        match tokio::time::timeout(timeout, wait_exit(&tracked)).await {
            Ok(result) => result,
            Err(_) => Err(IsolationError::timeout(&handle.env_id, "wait_process", timeout)),
        }
    }

    /// Graceful termination, forced once `grace_period` elapses.
    pub async fn stop(&self, handle: &ProcessHandle, grace_period: Duration) -> Result<ExitInfo> {
        let tracked = self.tracked(handle)?;
        if let Some(info) = tracked.exit_info() {
            return Ok(info);
        }

        debug!(env_id = %handle.env_id, pid = handle.pid, "Sending SIGTERM");
        tracked.signal(Signal::SIGTERM)?;
        if let Ok(result) = tokio::time::timeout(grace_period, wait_exit(&tracked)).await {
            return result;
        }

        warn!(
            env_id = %handle.env_id,
            pid = handle.pid,
            grace_ms = grace_period.as_millis() as u64,
            "Process ignored SIGTERM, sending SIGKILL"
        );
        tracked.signal(Signal::SIGKILL)?;
        match tokio::time::timeout(KILL_REAP_TIMEOUT, wait_exit(&tracked)).await {
            Ok(result) => result,
            Err(_) => Err(IsolationError::timeout(
                &handle.env_id,
                "kill_process",
                KILL_REAP_TIMEOUT,
            )),
        }
    }

    /// Stop every process bound to `env_id` and stop tracking them.
    pub async fn stop_all(&self, env_id: &str, grace_period: Duration) -> Result<()> {
        let handles = self.processes_for(env_id);
        let mut first_error = None;
        for handle in &handles {
            if let Err(e) = self.stop(handle, grace_period).await {
                warn!(env_id, pid = handle.pid, error = %e, "Failed to stop process");
                first_error.get_or_insert(e);
            } else {
                self.forget(handle);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn status(&self, handle: &ProcessHandle) -> Option<ProcessStatus> {
        let tracked = self.tracked(handle).ok()?;
        Some(match tracked.exit_info() {
            Some(info) => ProcessStatus::Exited(info),
            None => ProcessStatus::Running,
        })
    }

    pub fn output(&self, handle: &ProcessHandle) -> Option<CapturedOutput> {
        let tracked = self.tracked(handle).ok()?;
        let read = |buf: &Arc<Mutex<Vec<u8>>>| {
            String::from_utf8_lossy(&buf.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
        };
        Some(CapturedOutput {
            stdout: read(&tracked.stdout),
            stderr: read(&tracked.stderr),
        })
    }

    pub fn processes_for(&self, env_id: &str) -> Vec<ProcessHandle> {
        let mut handles: Vec<_> = self
            .processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p.handle.env_id == env_id)
            .map(|p| p.handle.clone())
            .collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn forget(&self, handle: &ProcessHandle) {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
    }

    /// Stop tracking those of `handles` that have exited and return the
    /// ones still running.  Handles not tracked here are dropped too.
    pub fn retain_running(&self, handles: Vec<ProcessHandle>) -> Vec<ProcessHandle> {
        let mut processes = self
            .processes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        handles
            .into_iter()
            .filter(|handle| match processes.get(&handle.id) {
                Some(tracked) if tracked.exit_info().is_some() => {
                    debug!(env_id = %handle.env_id, pid = handle.pid, "Evicting exited process");
                    processes.remove(&handle.id);
                    false
                }
                Some(_) => true,
                None => false,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tracked(&self, handle: &ProcessHandle) -> Result<Arc<TrackedProcess>> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| {
                IsolationError::validation(
                    &handle.env_id,
                    "lookup_process",
                    format!("process {} (pid {}) is not tracked", handle.id, handle.pid),
                )
            })
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_exit(tracked: &TrackedProcess) -> Result<ExitInfo> {
    let mut rx = tracked.exit.clone();
    let seen = rx.wait_for(Option::is_some).await.map_err(|_| {
        IsolationError::engine(
            &tracked.handle.env_id,
            "wait_process",
            anyhow::anyhow!("reaper for pid {} went away", tracked.handle.pid),
        )
    })?;
    Ok((*seen).unwrap_or_default())
}

fn capture<R>(mut source: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
            }
        }
    })
}
