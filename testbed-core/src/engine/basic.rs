//! Basic engine: a private directory and nothing else.
//!
//! Workloads run as ordinary host processes with their working directory
//! scoped to the environment.  No process boundary, no limits, no ports.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    prepare_directory, remove_directory, rolled_back, write_metadata, CreateLedger,
    CreateSpec, CreatedResource, EngineCapability, EngineContext, IsolationEngine,
    ValidationResult,
};
use crate::environment::{Environment, IsolationKind};
use crate::error::{IsolationError, Result};
use crate::process::CommandSpec;

pub struct BasicEngine {
    ctx: EngineContext,
}

impl BasicEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    fn unwind(&self, env_id: &str, ledger: &mut CreateLedger) -> Result<()> {
        for resource in ledger.unwind_order() {
            if let CreatedResource::Directory(path) = resource {
                remove_directory(env_id, &path)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IsolationEngine for BasicEngine {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Basic
    }

    fn capabilities(&self) -> EngineCapability {
        EngineCapability {
            supports_resource_limits: false,
            supports_networking: false,
            supports_private_network: false,
            relative_cost_weight: 1,
        }
    }

    async fn create(&self, spec: &CreateSpec) -> Result<Environment> {
        self.capabilities()
            .check(Some(spec.env_id.as_str()), self.kind(), &spec.config, &spec.limits)?;
        if !spec.ports.is_empty() {
            return Err(IsolationError::validation(
                &spec.env_id,
                "validate_network",
                "basic engine cannot hold ports",
            ));
        }

        let mut ledger = CreateLedger::default();
        if prepare_directory(&spec.env_id, &spec.path)? {
            ledger.record(CreatedResource::Directory(spec.path.clone()));
        }

        let env = spec.new_environment(self.kind());
        if let Err(e) = write_metadata(&env) {
            let rollback = self.unwind(&spec.env_id, &mut ledger);
            return rolled_back(e, rollback);
        }
        info!(env_id = %spec.env_id, path = %spec.path.display(), "Created basic environment");
        Ok(env)
    }

    async fn activate(&self, env: &mut Environment) -> Result<bool> {
        if !env.path.is_dir() {
            return Err(IsolationError::engine(
                &env.env_id,
                "activate",
                anyhow::anyhow!("{} is gone", env.path.display()),
            ));
        }
        Ok(true)
    }

    async fn deactivate(&self, env: &mut Environment) -> Result<bool> {
        self.ctx
            .processes
            .stop_all(&env.env_id, self.ctx.config.stop_grace_period())
            .await?;
        env.handle.processes.clear();
        Ok(true)
    }

    async fn cleanup(&self, env: &mut Environment, force: bool) -> Result<bool> {
        if let Err(e) = self
            .ctx
            .processes
            .stop_all(&env.env_id, self.ctx.config.stop_grace_period())
            .await
        {
            if !force {
                return Err(IsolationError::cleanup(
                    &env.env_id,
                    "stop_processes",
                    e.to_string(),
                ));
            }
            warn!(env_id = %env.env_id, error = %e, "Ignoring process stop failure");
        }
        env.handle.processes.clear();
        remove_directory(&env.env_id, &env.path)?;
        debug!(env_id = %env.env_id, "Removed basic environment");
        Ok(true)
    }

    async fn validate(&self, env: &Environment) -> ValidationResult {
        let mut result = ValidationResult::ok();
        match fs::metadata(&env.path) {
            Ok(meta) if meta.is_dir() => {
                if meta.permissions().mode() & 0o077 != 0 {
                    result.issue(format!("{} is accessible to other users", env.path.display()));
                }
            }
            Ok(_) => result.issue(format!("{} is not a directory", env.path.display())),
            Err(e) => result.issue(format!("{}: {e}", env.path.display())),
        }
        result
    }

    fn prepare_command(&self, env: &Environment, command: &CommandSpec) -> Result<CommandSpec> {
        let mut prepared = command.clone();
        prepared.cwd = Some(env.path.clone());
        prepared.new_process_group = true;
        prepared
            .env
            .insert("TESTBED_ENV_ID".into(), env.env_id.clone());
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::engine::resource_limits::ResolvedLimits;
    use crate::environment::{EnvironmentRequest, EnvironmentState};
    use crate::process::ProcessManager;
    use std::sync::Arc;

    fn engine() -> BasicEngine {
        BasicEngine::new(EngineContext {
            config: Arc::new(ManagerConfig::default()),
            processes: Arc::new(ProcessManager::new()),
        })
    }

    fn spec(path: std::path::PathBuf) -> CreateSpec {
        CreateSpec {
            path,
            env_id: "env-000001".into(),
            config: EnvironmentRequest::new(),
            limits: ResolvedLimits::default(),
            ports: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("env");
        let engine = engine();

        let mut env = engine.create(&spec(path.clone())).await.unwrap();
        assert_eq!(env.state, EnvironmentState::Creating);
        assert!(path.join(".testbed/environment.json").is_file());
        assert!(engine.validate(&env).await.is_valid());
        assert!(engine.activate(&mut env).await.unwrap());

        assert!(engine.cleanup(&mut env, false).await.unwrap());
        assert!(!path.exists());
        assert!(!engine.validate(&env).await.is_valid());
    }

    #[tokio::test]
    async fn test_rejects_limits() {
        let root = tempfile::tempdir().unwrap();
        let mut spec = spec(root.path().join("env"));
        spec.limits.disk_bytes = Some(1 << 20);
        let err = engine().create(&spec).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.step(), "validate_limits");
        assert!(!root.path().join("env").exists());
    }

    #[tokio::test]
    async fn test_prepare_command_scopes_cwd() {
        let root = tempfile::tempdir().unwrap();
        let env = Environment::new("env-9", root.path(), IsolationKind::Basic, Default::default());
        let cmd = engine()
            .prepare_command(&env, &CommandSpec::new("ls"))
            .unwrap();
        assert_eq!(cmd.cwd.as_deref(), Some(root.path()));
        assert_eq!(cmd.env.get("TESTBED_ENV_ID").map(String::as_str), Some("env-9"));
        assert!(cmd.new_process_group);
    }

    #[tokio::test]
    async fn test_deactivate_stops_processes() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine();
        let mut env = engine.create(&spec(root.path().join("env"))).await.unwrap();
        let cmd = engine
            .prepare_command(&env, &CommandSpec::new("sleep").arg("30"))
            .unwrap();
        let handle = engine.ctx.processes.spawn(&env.env_id, &cmd).unwrap();
        env.handle.processes.push(handle);

        assert!(engine.deactivate(&mut env).await.unwrap());
        assert!(engine.ctx.processes.processes_for(&env.env_id).is_empty());
        assert!(env.handle.processes.is_empty());
    }
}
