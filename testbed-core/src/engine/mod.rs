//! Engine module - Isolation backends
//!
//! Each backend implements [`IsolationEngine`] for one member of the closed
//! set of [`IsolationKind`]s.  The manager owns environments and drives the
//! shared state machine; engines only perform the primitive work for each
//! step and report capability, health, and usage.

pub mod basic;
pub mod container;
pub mod process_venv;
pub mod resource_limits;

pub use basic::BasicEngine;
pub use container::ContainerEngine;
pub use process_venv::ProcessVenvEngine;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::config::ManagerConfig;
use crate::environment::{Environment, EnvironmentRequest, IsolationKind};
use crate::error::{IsolationError, Result};
use crate::process::{CommandSpec, ProcessManager};
use resource_limits::{ResolvedLimits, ResourceUsage};

/// Static description of what a backend can enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapability {
    pub supports_resource_limits: bool,
    pub supports_networking: bool,
    /// Only the container backend provides a private subnet.
    pub supports_private_network: bool,
    pub relative_cost_weight: u32,
}

impl EngineCapability {
    /// Reject requests this backend cannot honour instead of silently
    /// ignoring them.
    pub fn check(
        &self,
        env_id: Option<&str>,
        kind: IsolationKind,
        request: &EnvironmentRequest,
        limits: &ResolvedLimits,
    ) -> Result<()> {
        if !limits.is_unbounded() && !self.supports_resource_limits {
            return Err(IsolationError::validation(
                env_id,
                "validate_limits",
                format!("{kind} engine cannot enforce resource limits"),
            ));
        }
        if let Some(network) = &request.network {
            if !network.ports.is_empty() && !self.supports_networking {
                return Err(IsolationError::validation(
                    env_id,
                    "validate_network",
                    format!("{kind} engine cannot map ports"),
                ));
            }
            if network.subnet.is_some() && !self.supports_private_network {
                return Err(IsolationError::validation(
                    env_id,
                    "validate_network",
                    format!("{kind} engine has no private network for a subnet"),
                ));
            }
        }
        Ok(())
    }
}

/// Health report from [`IsolationEngine::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub issues: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Everything an engine needs to create one environment.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub path: PathBuf,
    pub env_id: String,
    pub config: EnvironmentRequest,
    pub limits: ResolvedLimits,
    pub ports: Vec<u16>,
}

impl CreateSpec {
    /// Fresh environment record in CREATING, carrying the spec's inputs.
    pub fn new_environment(&self, kind: IsolationKind) -> Environment {
        let mut env = Environment::new(&self.env_id, &self.path, kind, self.config.clone());
        env.state = crate::environment::EnvironmentState::Creating;
        env.limits = self.limits;
        env.allocated_ports = self.ports.clone();
        env
    }
}

/// Identifies what the resource monitor samples.
#[derive(Debug, Clone)]
pub struct UsageProbe {
    pub env_id: String,
    pub path: PathBuf,
    pub container_id: Option<String>,
}

impl From<&Environment> for UsageProbe {
    fn from(env: &Environment) -> Self {
        Self {
            env_id: env.env_id.clone(),
            path: env.path.clone(),
            container_id: env.handle.container_id.clone(),
        }
    }
}

/// Shared primitives handed to engines at construction.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<ManagerConfig>,
    pub processes: Arc<ProcessManager>,
}

/// Builds an engine from the shared context.
pub type EngineFactory = Arc<dyn Fn(&EngineContext) -> Arc<dyn IsolationEngine> + Send + Sync>;

/// The pluggable backend interface.
///
/// On `create` failure an engine rolls back whatever it already did before
/// returning.  If that rollback itself fails it returns a `Cleanup` error
/// carrying the original failure.
#[async_trait]
pub trait IsolationEngine: Send + Sync {
    fn kind(&self) -> IsolationKind;

    fn capabilities(&self) -> EngineCapability;

    async fn create(&self, spec: &CreateSpec) -> Result<Environment>;

    async fn activate(&self, env: &mut Environment) -> Result<bool>;

    async fn deactivate(&self, env: &mut Environment) -> Result<bool>;

    async fn cleanup(&self, env: &mut Environment, force: bool) -> Result<bool>;

    async fn validate(&self, env: &Environment) -> ValidationResult;

    /// Rewrite `command` so it runs inside `env`.
    fn prepare_command(&self, env: &Environment, command: &CommandSpec) -> Result<CommandSpec>;

    /// Install prefix for packages, as seen from inside the environment.
    fn package_prefix(&self, env: &Environment) -> PathBuf {
        env.path.join(".testbed").join("packages")
    }

    /// Sample usage through the backend's native accounting.
    async fn sample_usage(&self, probe: &UsageProbe) -> Result<ResourceUsage> {
        Err(IsolationError::validation(
            &probe.env_id,
            "sample_usage",
            format!("{} engine has no resource accounting", self.kind()),
        ))
    }

    /// Reference to the image layers backing `env`, if any.
    fn image_reference(&self, _env: &Environment) -> Option<String> {
        None
    }
}

/// A resource `create` has already produced, recorded so a later failure
/// can undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CreatedResource {
    Directory(PathBuf),
    Network(String),
    Container(String),
}

/// Completed creation steps, unwound newest first.
#[derive(Debug, Default)]
pub(crate) struct CreateLedger {
    entries: Vec<CreatedResource>,
}

impl CreateLedger {
    pub(crate) fn record(&mut self, resource: CreatedResource) {
        self.entries.push(resource);
    }

    pub(crate) fn unwind_order(&mut self) -> Vec<CreatedResource> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }
}

/// Report `original` after a rollback attempt.  A failed rollback becomes a
/// `Cleanup` error carrying the original.
pub(crate) fn rolled_back<T>(original: IsolationError, rollback: Result<()>) -> Result<T> {
    match rollback {
        Ok(()) => Err(original),
        Err(failure) => {
            error!(
                env_id = original.env_id().unwrap_or("<unassigned>"),
                step = original.step(),
                error = %failure,
                "Rollback failed"
            );
            let failure = if failure.is_cleanup() {
                failure
            } else {
                IsolationError::cleanup(
                    original.env_id(),
                    "rollback",
                    failure.to_string(),
                )
            };
            Err(failure.during_rollback_of(original))
        }
    }
}

/// Persist a point-in-time description next to the environment's files.
pub(crate) fn write_metadata(env: &Environment) -> Result<()> {
    let path = env.path.join(".testbed").join("environment.json");
    let body = serde_json::to_vec_pretty(&env.summary())
        .context("cannot serialise environment metadata")
        .map_err(|e| IsolationError::engine(&env.env_id, "write_metadata", e))?;
    fs::write(&path, body)
        .with_context(|| format!("cannot write {}", path.display()))
        .map_err(|e| IsolationError::engine(&env.env_id, "write_metadata", e))
}

/// Create the environment directory with owner-only permissions.
///
/// The path must not exist yet or be an empty directory; cleanup removes
/// the whole directory, so pre-existing content is refused.  Returns `true`
/// when the directory was newly created.
pub(crate) fn prepare_directory(env_id: &str, path: &Path) -> Result<bool> {
    let existed = path.exists();
    if existed {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("cannot read {}", path.display()))
            .map_err(|e| IsolationError::engine(env_id, "prepare_directory", e))?;
        if entries.next().is_some() {
            return Err(IsolationError::validation(
                env_id,
                "prepare_directory",
                format!("{} exists and is not empty", path.display()),
            ));
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("cannot create {}", path.display()))
            .map_err(|e| IsolationError::engine(env_id, "prepare_directory", e))?;
    }
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("cannot restrict permissions on {}", path.display()))
        .map_err(|e| IsolationError::engine(env_id, "prepare_directory", e))?;
    fs::create_dir_all(path.join(".testbed"))
        .with_context(|| format!("cannot create metadata dir in {}", path.display()))
        .map_err(|e| IsolationError::engine(env_id, "prepare_directory", e))?;
    debug!(env_id, path = %path.display(), "Environment directory ready");
    Ok(!existed)
}

/// Remove the environment directory.  A missing directory counts as removed.
pub(crate) fn remove_directory(env_id: &str, path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IsolationError::cleanup(
            env_id,
            "remove_directory",
            format!("{}: {e}", path.display()),
        )),
    }
}

/// Total size of regular files under `path`.
pub(crate) fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Build the default engine for `kind`.
pub fn default_engine(kind: IsolationKind, ctx: &EngineContext) -> Arc<dyn IsolationEngine> {
    match kind {
        IsolationKind::Basic => Arc::new(BasicEngine::new(ctx.clone())),
        IsolationKind::ProcessVenv => Arc::new(ProcessVenvEngine::new(ctx.clone())),
        IsolationKind::Container => Arc::new(ContainerEngine::new(ctx.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_directory_creates_private_dir() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("env");
        assert!(prepare_directory("env-1", &path).unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        assert!(path.join(".testbed").is_dir());
    }

    #[test]
    fn test_prepare_directory_refuses_populated_path() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("keep.txt"), b"data").unwrap();
        let err = prepare_directory("env-1", root.path()).unwrap_err();
        assert!(err.is_validation());
        assert!(root.path().join("keep.txt").exists());
    }

    #[test]
    fn test_remove_missing_directory_is_ok() {
        let root = tempfile::tempdir().unwrap();
        remove_directory("env-1", &root.path().join("never-created")).unwrap();
    }

    #[test]
    fn test_directory_size() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("a/b")).unwrap();
        fs::write(root.path().join("a/one"), vec![0u8; 100]).unwrap();
        fs::write(root.path().join("a/b/two"), vec![0u8; 50]).unwrap();
        assert_eq!(directory_size(root.path()), 150);
    }

    #[test]
    fn test_capability_check() {
        let basic = EngineCapability {
            supports_resource_limits: false,
            supports_networking: false,
            supports_private_network: false,
            relative_cost_weight: 1,
        };
        let limited = ResolvedLimits {
            disk_bytes: Some(1024),
            ..Default::default()
        };
        let bare = EnvironmentRequest::new();
        basic
            .check(Some("env-1"), IsolationKind::Basic, &bare, &ResolvedLimits::default())
            .unwrap();
        let err = basic
            .check(Some("env-1"), IsolationKind::Basic, &bare, &limited)
            .unwrap_err();
        assert_eq!(err.step(), "validate_limits");

        let ported = EnvironmentRequest::new().with_ports(vec![80]);
        let err = basic
            .check(None, IsolationKind::Basic, &ported, &ResolvedLimits::default())
            .unwrap_err();
        assert_eq!(err.step(), "validate_network");
    }

    #[test]
    fn test_ledger_unwinds_newest_first() {
        let mut ledger = CreateLedger::default();
        ledger.record(CreatedResource::Directory("/tmp/a".into()));
        ledger.record(CreatedResource::Container("c1".into()));
        assert_eq!(
            ledger.unwind_order(),
            vec![
                CreatedResource::Container("c1".into()),
                CreatedResource::Directory("/tmp/a".into()),
            ]
        );
        assert!(ledger.unwind_order().is_empty());
    }

    #[test]
    fn test_failed_rollback_keeps_original() {
        let original = IsolationError::engine("env-1", "start_container", anyhow::anyhow!("boom"));
        let failure = IsolationError::cleanup("env-1", "remove_directory", "busy");
        let err = rolled_back::<()>(original, Err(failure)).unwrap_err();
        match err {
            IsolationError::Cleanup { original: Some(inner), step, .. } => {
                assert_eq!(step, "remove_directory");
                assert_eq!(inner.step(), "start_container");
            }
            other => panic!("unexpected error {other}"),
        }

        let plain = IsolationError::validation("env-1", "x", "y");
        assert!(rolled_back::<()>(plain, Ok(())).unwrap_err().is_validation());
    }

    #[test]
    fn test_validation_result() {
        let mut result = ValidationResult::ok();
        assert!(result.is_valid());
        result.issue("directory missing");
        assert!(!result.is_valid());
    }
}
