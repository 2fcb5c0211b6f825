//! Parallel Package Installation
//!
//! Installing packages one after another makes environment creation scale
//! linearly with the package count.  [`ParallelInstaller`] runs independent
//! installs on a fixed-size pool of worker tasks, so total time approaches
//! the slowest installs rather than their sum.
//!
//! # Design:
//! - Workers pull from a shared queue; the pool size bounds concurrency
//! - One [`InstallResult`] per input package, in input order
//! - A failing install never cancels its siblings; a cancelled token stops
//!   workers from picking up new work, and undispatched packages are
//!   reported as cancelled

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InstallerConfig;
use crate::error::{IsolationError, Result};
use crate::package::PackageSpec;
use crate::process::{CommandSpec, ProcessHandle, ProcessManager};

/// Grace period for installer commands abandoned mid-run.
const ABANDON_GRACE: Duration = Duration::from_secs(2);

/// Rewrites a command so it runs inside a specific environment.
pub type CommandWrapper = Arc<dyn Fn(CommandSpec) -> Result<CommandSpec> + Send + Sync>;

/// Where packages go and how commands reach that place.
#[derive(Clone)]
pub struct InstallTarget {
    pub env_id: String,
    /// Install prefix as seen from inside the environment.
    pub prefix: PathBuf,
    pub wrap: CommandWrapper,
}

impl InstallTarget {
    /// A target whose commands run unmodified on the host.
    pub fn host(env_id: impl Into<String>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            env_id: env_id.into(),
            prefix: prefix.into(),
            wrap: Arc::new(|spec: CommandSpec| -> Result<CommandSpec> { Ok(spec) }),
        }
    }
}

impl fmt::Debug for InstallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallTarget")
            .field("env_id", &self.env_id)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Installs a single package and reports the version that ended up installed.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, target: &InstallTarget, package: &PackageSpec) -> Result<String>;
}

/// Runs an external installer program (pip-style by default).
pub struct CommandInstaller {
    config: InstallerConfig,
    processes: Arc<ProcessManager>,
    timeout: Duration,
}

impl CommandInstaller {
    pub fn new(config: InstallerConfig, processes: Arc<ProcessManager>, timeout: Duration) -> Self {
        Self {
            config,
            processes,
            timeout,
        }
    }

    fn render(&self, args: &[String], target: &InstallTarget, package: &PackageSpec) -> CommandSpec {
        let prefix = target.prefix.display().to_string();
        let requirement = package.requirement();
        CommandSpec::new(self.config.program.clone()).args(args.iter().map(|arg| {
            arg.replace("{prefix}", &prefix)
                .replace("{requirement}", &requirement)
                .replace("{name}", &package.name)
        }))
    }

    async fn run(&self, target: &InstallTarget, spec: CommandSpec, step: &str) -> Result<String> {
        let spec = (target.wrap)(spec)?;
        let handle = self.processes.spawn(&target.env_id, &spec)?;
        let guard = StopOnDrop::new(Arc::clone(&self.processes), handle.clone());
        let exit = match self.processes.wait(&handle, self.timeout).await {
            Ok(exit) => exit,
            Err(e) if e.is_timeout() => {
                return Err(IsolationError::timeout(&target.env_id, step, self.timeout));
            }
            Err(e) => return Err(e),
        };
        let output = self.processes.output(&handle).unwrap_or_default();
        guard.release();
        if !exit.success() {
            return Err(IsolationError::engine(
                &target.env_id,
                step,
                anyhow::anyhow!(
                    "{} exited with {:?}: {}",
                    spec.program,
                    exit.code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(output.stdout)
    }
}

/// Stops and untracks an installer command whose caller stopped waiting,
/// whether through its own timeout or by being dropped from the outside.
struct StopOnDrop {
    processes: Arc<ProcessManager>,
    handle: Option<ProcessHandle>,
}

impl StopOnDrop {
    fn new(processes: Arc<ProcessManager>, handle: ProcessHandle) -> Self {
        Self {
            processes,
            handle: Some(handle),
        }
    }

    /// The command ran to completion; just stop tracking it.
    fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.processes.forget(&handle);
        }
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let processes = Arc::clone(&self.processes);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            processes.forget(&handle);
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = processes.stop(&handle, ABANDON_GRACE).await {
                warn!(
                    env_id = %handle.env_id,
                    pid = handle.pid,
                    error = %e,
                    "Failed to stop abandoned installer"
                );
            }
            processes.forget(&handle);
        });
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    async fn install(&self, target: &InstallTarget, package: &PackageSpec) -> Result<String> {
        let step = format!("install_package:{}", package.name);
        let install = self.render(&self.config.install_args, target, package);
        let stdout = self.run(target, install, &step).await?;

        if let Some(pinned) = package.constraint()?.exact() {
            return Ok(pinned.to_string());
        }
        if let Some(version) = installed_version_from_log(&stdout, &package.name) {
            return Ok(version);
        }
        if !self.config.version_args.is_empty() {
            let query = self.render(&self.config.version_args, target, package);
            let stdout = self.run(target, query, &step).await?;
            if let Some(version) = version_from_show(&stdout) {
                return Ok(version);
            }
        }
        Err(IsolationError::engine(
            &target.env_id,
            step,
            anyhow::anyhow!("could not determine the installed version of {}", package.name),
        ))
    }
}

/// Find `name-1.2.3` in a `Successfully installed ...` line.
fn installed_version_from_log(log: &str, name: &str) -> Option<String> {
    let wanted = normalize_name(name);
    log.lines()
        .filter(|line| line.trim_start().starts_with("Successfully installed"))
        .flat_map(|line| line.split_whitespace().skip(2))
        .find_map(|token| {
            let (pkg, version) = token.rsplit_once('-')?;
            (normalize_name(pkg) == wanted).then(|| version.to_string())
        })
}

/// Parse `Version: x.y.z` out of a package query.
fn version_from_show(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.strip_prefix("Version:")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}

/// Outcome of a single package install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { version: String },
    Failed { message: String },
    /// Never dispatched because cancellation was observed first.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct InstallResult {
    pub package: PackageSpec,
    pub outcome: InstallOutcome,
    pub duration: Duration,
}

impl InstallResult {
    pub fn success(&self) -> bool {
        matches!(self.outcome, InstallOutcome::Installed { .. })
    }

    /// The package with `resolved_version` filled in, if installed.
    pub fn resolved(&self) -> Option<PackageSpec> {
        match &self.outcome {
            InstallOutcome::Installed { version } => {
                let mut spec = self.package.clone();
                spec.resolved_version = Some(version.clone());
                Some(spec)
            }
            _ => None,
        }
    }
}

/// Aggregated results from [`ParallelInstaller::install_batch`].
#[derive(Debug)]
pub struct InstallReport {
    pub results: Vec<InstallResult>,
    pub total_duration: Duration,
}

impl InstallReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(InstallResult::success)
    }

    pub fn failures(&self) -> Vec<&InstallResult> {
        self.results.iter().filter(|r| !r.success()).collect()
    }
}

/// Bounded-concurrency executor for independent package installs.
#[derive(Clone)]
pub struct ParallelInstaller {
    installer: Arc<dyn PackageInstaller>,
    per_package_timeout: Duration,
}

impl ParallelInstaller {
    pub fn new(installer: Arc<dyn PackageInstaller>, per_package_timeout: Duration) -> Self {
        Self {
            installer,
            per_package_timeout,
        }
    }

    /// Install `packages` with at most `max_workers` running at once.
    ///
    /// Always returns exactly one result per input, in input order.
    pub async fn install_batch(
        &self,
        target: &InstallTarget,
        packages: Vec<PackageSpec>,
        max_workers: usize,
        cancel: &CancellationToken,
    ) -> InstallReport {
        let start = Instant::now();
        let total = packages.len();
        let workers = max_workers.max(1).min(total.max(1));
        info!(env_id = %target.env_id, packages = total, workers, "Starting parallel install");

        let queue: Arc<Mutex<VecDeque<(usize, PackageSpec)>>> =
            Arc::new(Mutex::new(packages.iter().cloned().enumerate().collect()));
        let slots: Arc<Mutex<Vec<Option<InstallResult>>>> =
            Arc::new(Mutex::new(vec![None; total]));

        let mut pool = Vec::with_capacity(workers);
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let slots = Arc::clone(&slots);
            let installer = Arc::clone(&self.installer);
            let target = target.clone();
            let cancel = cancel.clone();
            let timeout = self.per_package_timeout;
            pool.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker, "Cancellation observed, worker stopping");
                        break;
                    }
                    let Some((index, package)) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let result = install_one(installer.as_ref(), &target, package, timeout).await;
                    slots.lock().await[index] = Some(result);
                }
            }));
        }
        for worker in pool {
            // A worker only ends early by panicking inside the installer;
            // its package is then reported as failed below.
            let _ = worker.await;
        }

        let filled = std::mem::take(&mut *slots.lock().await);
        let results: Vec<InstallResult> = filled
            .into_iter()
            .zip(packages)
            .map(|(slot, package)| {
                slot.unwrap_or_else(|| InstallResult {
                    outcome: if cancel.is_cancelled() {
                        InstallOutcome::Cancelled
                    } else {
                        InstallOutcome::Failed {
                            message: "installer worker terminated unexpectedly".to_string(),
                        }
                    },
                    package,
                    duration: Duration::ZERO,
                })
            })
            .collect();

        let total_duration = start.elapsed();
        info!(
            env_id = %target.env_id,
            total_ms = total_duration.as_millis() as u64,
            succeeded = results.iter().filter(|r| r.success()).count(),
            failed = results.iter().filter(|r| !r.success()).count(),
            "Parallel install complete"
        );
        InstallReport {
            results,
            total_duration,
        }
    }
}

async fn install_one(
    installer: &dyn PackageInstaller,
    target: &InstallTarget,
    package: PackageSpec,
    timeout: Duration,
) -> InstallResult {
    let start = Instant::now();
    debug!(env_id = %target.env_id, package = %package.name, "Installing package");
    let outcome = match tokio::time::timeout(timeout, installer.install(target, &package)).await {
        Ok(Ok(version)) => InstallOutcome::Installed { version },
        Ok(Err(e)) => InstallOutcome::Failed {
            message: e.to_string(),
        },
        Err(_) => InstallOutcome::Failed {
            message: IsolationError::timeout(
                &target.env_id,
                format!("install_package:{}", package.name),
                timeout,
            )
            .to_string(),
        },
    };
    InstallResult {
        package,
        outcome,
        duration: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Installs anything except names starting with `bad`, tracking peak
    /// concurrency.
    struct FakeInstaller {
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl FakeInstaller {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl PackageInstaller for FakeInstaller {
        async fn install(&self, target: &InstallTarget, package: &PackageSpec) -> Result<String> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if package.name.starts_with("bad") {
                return Err(IsolationError::engine(
                    &target.env_id,
                    "install_package",
                    anyhow::anyhow!("no such package"),
                ));
            }
            Ok("1.0.0".to_string())
        }
    }

    fn specs(names: &[&str]) -> Vec<PackageSpec> {
        names.iter().map(|n| PackageSpec::new(*n, "*")).collect()
    }

    #[tokio::test]
    async fn test_results_in_input_order_regardless_of_workers() {
        let names = ["a", "bad-b", "c", "d", "bad-e", "f", "g"];
        for workers in [1, 2, 3, 16] {
            let installer = ParallelInstaller::new(
                FakeInstaller::new(Duration::from_millis(5)),
                Duration::from_secs(5),
            );
            let report = installer
                .install_batch(
                    &InstallTarget::host("env-1", "/tmp"),
                    specs(&names),
                    workers,
                    &CancellationToken::new(),
                )
                .await;
            assert_eq!(report.results.len(), names.len());
            for (result, name) in report.results.iter().zip(names) {
                assert_eq!(result.package.name, name);
                assert_eq!(result.success(), !name.starts_with("bad"));
            }
            assert_eq!(report.failures().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let fake = FakeInstaller::new(Duration::from_millis(20));
        let installer = ParallelInstaller::new(fake.clone(), Duration::from_secs(5));
        let report = installer
            .install_batch(
                &InstallTarget::host("env-1", "/tmp"),
                specs(&["a", "b", "c", "d", "e", "f", "g", "h"]),
                3,
                &CancellationToken::new(),
            )
            .await;
        assert!(report.all_succeeded());
        assert!(fake.peak.load(Ordering::SeqCst) <= 3);
        assert!(fake.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_dispatch() {
        let installer = ParallelInstaller::new(
            FakeInstaller::new(Duration::from_millis(50)),
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = installer
            .install_batch(
                &InstallTarget::host("env-1", "/tmp"),
                specs(&["a", "b", "c", "d", "e"]),
                1,
                &cancel,
            )
            .await;
        assert_eq!(report.results.len(), 5);
        // The in-flight install completes; nothing after it is dispatched.
        assert!(report.results[0].success());
        assert!(report.results[1..]
            .iter()
            .all(|r| r.outcome == InstallOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_per_package_timeout() {
        let installer = ParallelInstaller::new(
            FakeInstaller::new(Duration::from_millis(200)),
            Duration::from_millis(20),
        );
        let report = installer
            .install_batch(
                &InstallTarget::host("env-1", "/tmp"),
                specs(&["slow"]),
                2,
                &CancellationToken::new(),
            )
            .await;
        match &report.results[0].outcome {
            InstallOutcome::Failed { message } => assert!(message.contains("timed out")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let installer = ParallelInstaller::new(
            FakeInstaller::new(Duration::ZERO),
            Duration::from_secs(1),
        );
        let report = installer
            .install_batch(
                &InstallTarget::host("env-1", "/tmp"),
                Vec::new(),
                4,
                &CancellationToken::new(),
            )
            .await;
        assert!(report.results.is_empty());
        assert!(report.all_succeeded());
    }

    #[test]
    fn test_version_parsing_helpers() {
        let log = "Collecting Flask\nSuccessfully installed Jinja2-3.1.2 flask-2.3.2 itsdangerous-2.1.2\n";
        assert_eq!(installed_version_from_log(log, "Flask").as_deref(), Some("2.3.2"));
        assert_eq!(installed_version_from_log(log, "jinja2").as_deref(), Some("3.1.2"));
        assert_eq!(installed_version_from_log(log, "redis"), None);
        assert_eq!(
            version_from_show("Name: redis\nVersion: 5.0.1\n").as_deref(),
            Some("5.0.1")
        );
    }

    #[tokio::test]
    async fn test_outer_timeout_stops_installer_process() {
        let processes = Arc::new(ProcessManager::new());
        let config = InstallerConfig {
            program: "sleep".to_string(),
            install_args: vec!["30".into()],
            version_args: Vec::new(),
        };
        let timeout = Duration::from_millis(300);
        let installer = ParallelInstaller::new(
            Arc::new(CommandInstaller::new(config, Arc::clone(&processes), timeout)),
            timeout,
        );
        let report = installer
            .install_batch(
                &InstallTarget::host("env-1", "/tmp"),
                specs(&["slow"]),
                1,
                &CancellationToken::new(),
            )
            .await;
        match &report.results[0].outcome {
            InstallOutcome::Failed { message } => assert!(message.contains("timed out")),
            other => panic!("unexpected outcome {other:?}"),
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while !processes.processes_for("env-1").is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(processes.processes_for("env-1").is_empty());
    }

    #[tokio::test]
    async fn test_command_installer_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = InstallerConfig {
            program: "sh".to_string(),
            install_args: vec![
                "-c".into(),
                "echo Successfully installed {name}-4.2.0; touch {prefix}/{name}".into(),
            ],
            version_args: Vec::new(),
        };
        let installer = CommandInstaller::new(
            config,
            Arc::new(ProcessManager::new()),
            Duration::from_secs(5),
        );
        let target = InstallTarget::host("env-1", dir.path());
        let version = installer
            .install(&target, &PackageSpec::new("widget", ">=4"))
            .await
            .unwrap();
        assert_eq!(version, "4.2.0");
        assert!(dir.path().join("widget").exists());

        let pinned = installer
            .install(&target, &PackageSpec::new("gadget", "==1.1"))
            .await
            .unwrap();
        assert_eq!(pinned, "1.1");
    }
}
