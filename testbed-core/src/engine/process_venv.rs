//! Process virtual-environment engine.
//!
//! Each environment gets its own runtime tree (`bin`, `lib`, `home`, `tmp`)
//! and every workload runs in a scrubbed process context rooted there: own
//! process group, private `HOME`/`TMPDIR`, `PATH` resolving the environment's
//! `bin` first.  Limits are soft: usage is read from OS process statistics
//! and enforced by the resource monitor.
//!
//! # Design:
//! - Usage covers the whole process tree of every tracked workload
//! - Disk usage is the size of the environment directory
//! - One `System` is reused across samples so cpu usage has a baseline

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use super::resource_limits::ResourceUsage;
use super::{
    directory_size, prepare_directory, remove_directory, rolled_back, write_metadata,
    CreateLedger, CreateSpec, CreatedResource, EngineCapability, EngineContext,
    IsolationEngine, UsageProbe, ValidationResult,
};
use crate::environment::{Environment, IsolationKind};
use crate::error::{IsolationError, Result};
use crate::process::CommandSpec;

const LAYOUT: [&str; 4] = ["bin", "lib", "home", "tmp"];
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Parent links followed when attributing a process to a workload.
const MAX_TREE_DEPTH: usize = 32;

pub struct ProcessVenvEngine {
    ctx: EngineContext,
    system: Arc<Mutex<System>>,
}

impl ProcessVenvEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    fn build_layout(&self, env: &Environment) -> Result<()> {
        for dir in LAYOUT {
            let path = env.path.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("cannot create {}", path.display()))
                .map_err(|e| IsolationError::engine(&env.env_id, "create_layout", e))?;
        }
        let activate = env.path.join("bin").join("activate");
        let mut script = String::from("# source this file to enter the environment\n");
        for (key, value) in self.context_vars(env) {
            script.push_str(&format!("export {key}='{}'\n", value.replace('\'', "'\\''")));
        }
        fs::write(&activate, script)
            .with_context(|| format!("cannot write {}", activate.display()))
            .map_err(|e| IsolationError::engine(&env.env_id, "create_layout", e))?;
        write_metadata(env)
    }

    /// Variables every workload in `env` sees.
    fn context_vars(&self, env: &Environment) -> Vec<(String, String)> {
        let host_path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
        let root = env.path.display().to_string();
        let mut vars = vec![
            ("PATH".to_string(), format!("{root}/bin:{host_path}")),
            ("HOME".to_string(), format!("{root}/home")),
            ("TMPDIR".to_string(), format!("{root}/tmp")),
            ("VIRTUAL_ENV".to_string(), root),
            ("TESTBED_ENV_ID".to_string(), env.env_id.clone()),
        ];
        for (internal, host) in env.port_mappings() {
            vars.push((format!("TESTBED_PORT_{internal}"), host.to_string()));
        }
        vars
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
impl IsolationEngine for ProcessVenvEngine {
    fn kind(&self) -> IsolationKind {
        IsolationKind::ProcessVenv
    }

    fn capabilities(&self) -> EngineCapability {
        EngineCapability {
            supports_resource_limits: true,
            supports_networking: true,
            supports_private_network: false,
            relative_cost_weight: 5,
        }
    }

    async fn create(&self, spec: &CreateSpec) -> Result<Environment> {
        self.capabilities()
            .check(Some(spec.env_id.as_str()), self.kind(), &spec.config, &spec.limits)?;

        let mut ledger = CreateLedger::default();
        if prepare_directory(&spec.env_id, &spec.path)? {
            ledger.record(CreatedResource::Directory(spec.path.clone()));
        }

        let env = spec.new_environment(self.kind());
        if let Err(e) = self.build_layout(&env) {
            let rollback = self.unwind(&spec.env_id, &mut ledger);
            return rolled_back(e, rollback);
        }
        info!(
            env_id = %spec.env_id,
            path = %spec.path.display(),
            ports = ?spec.ports,
            "Created process environment"
        );
        Ok(env)
    }

    async fn activate(&self, env: &mut Environment) -> Result<bool> {
        let issues = self.validate(env).await.issues;
        if !issues.is_empty() {
            return Err(IsolationError::engine(
                &env.env_id,
                "activate",
                anyhow::anyhow!(issues.join("; ")),
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
        debug!(env_id = %env.env_id, "Stopped environment processes");
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
        Ok(true)
    }

    async fn validate(&self, env: &Environment) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if !env.path.is_dir() {
            result.issue(format!("{} is missing", env.path.display()));
            return result;
        }
        for dir in LAYOUT {
            if !env.path.join(dir).is_dir() {
                result.issue(format!("runtime directory '{dir}' is missing"));
            }
        }
        result
    }

    fn prepare_command(&self, env: &Environment, command: &CommandSpec) -> Result<CommandSpec> {
        let mut prepared = command.clone();
        prepared.cwd = Some(env.path.clone());
        prepared.clear_env = true;
        prepared.new_process_group = true;
        for (key, value) in self.context_vars(env) {
            prepared.env.entry(key).or_insert(value);
        }
        Ok(prepared)
    }

    fn package_prefix(&self, env: &Environment) -> PathBuf {
        env.path.clone()
    }

    async fn sample_usage(&self, probe: &UsageProbe) -> Result<ResourceUsage> {
        let roots: HashSet<u32> = self
            .ctx
            .processes
            .processes_for(&probe.env_id)
            .iter()
            .map(|h| h.pid)
            .collect();
        let system = Arc::clone(&self.system);
        let path = probe.path.clone();

        tokio::task::spawn_blocking(move || {
            let (memory, cpu) = {
                let mut sys = system.lock().unwrap_or_else(PoisonError::into_inner);
                sys.refresh_processes();
                tree_usage(&sys, &roots)
            };
            ResourceUsage {
                memory_bytes: Some(memory),
                cpu_cores: Some(cpu),
                disk_bytes: Some(directory_size(&path)),
            }
        })
        .await
        .map_err(|e| IsolationError::engine(&probe.env_id, "sample_usage", e))
    }
}

/// Memory (bytes) and cpu (cores) used by `roots` and their descendants.
fn tree_usage(sys: &System, roots: &HashSet<u32>) -> (u64, f64) {
    if roots.is_empty() {
        return (0, 0.0);
    }
    let in_tree = |mut pid: Pid| {
        for _ in 0..MAX_TREE_DEPTH {
            if roots.contains(&pid.as_u32()) {
                return true;
            }
            match sys.process(pid).and_then(|p| p.parent()) {
                Some(parent) => pid = parent,
                None => return false,
            }
        }
        false
    };
    sys.processes()
        .iter()
        .filter(|(pid, _)| in_tree(**pid))
        .fold((0u64, 0.0f64), |(mem, cpu), (_, process)| {
            (
                mem + process.memory(),
                cpu + f64::from(process.cpu_usage()) / 100.0,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::engine::resource_limits::ResolvedLimits;
    use crate::environment::EnvironmentRequest;
    use crate::process::ProcessManager;
    use std::time::Duration;

    fn engine() -> ProcessVenvEngine {
        ProcessVenvEngine::new(EngineContext {
            config: Arc::new(ManagerConfig::default()),
            processes: Arc::new(ProcessManager::new()),
        })
    }

    fn spec(path: PathBuf, ports: Vec<u16>) -> CreateSpec {
        CreateSpec {
            path,
            env_id: "env-000002".into(),
            config: EnvironmentRequest::new().with_ports(vec![5432; ports.len()]),
            limits: ResolvedLimits::default(),
            ports,
        }
    }

    #[tokio::test]
    async fn test_create_builds_runtime_tree() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("venv");
        let engine = engine();
        let mut env = engine.create(&spec(path.clone(), vec![])).await.unwrap();

        for dir in LAYOUT {
            assert!(path.join(dir).is_dir(), "{dir} missing");
        }
        assert!(path.join("bin/activate").is_file());
        assert!(engine.activate(&mut env).await.unwrap());

        fs::remove_dir_all(path.join("lib")).unwrap();
        assert!(engine.activate(&mut env).await.is_err());

        assert!(engine.cleanup(&mut env, false).await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_subnet_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut spec = spec(root.path().join("venv"), vec![]);
        spec.config.network.get_or_insert_with(Default::default).subnet =
            Some("10.1.0.0/24".into());
        let err = engine().create(&spec).await.unwrap_err();
        assert_eq!(err.step(), "validate_network");
    }

    #[tokio::test]
    async fn test_commands_run_in_scrubbed_context() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("venv");
        let engine = engine();
        let env = engine.create(&spec(path.clone(), vec![20123])).await.unwrap();

        let cmd = engine
            .prepare_command(
                &env,
                &CommandSpec::new("sh")
                    .arg("-c")
                    .arg("echo \"$HOME|$TESTBED_PORT_5432|$(pwd)|${OUTSIDE:-unset}\""),
            )
            .unwrap();
        std::env::set_var("OUTSIDE", "leak");
        let handle = engine.ctx.processes.spawn(&env.env_id, &cmd).unwrap();
        engine
            .ctx
            .processes
            .wait(&handle, Duration::from_secs(5))
            .await
            .unwrap();
        let out = engine.ctx.processes.output(&handle).unwrap().stdout;
        let canonical = fs::canonicalize(&path).unwrap();
        assert_eq!(
            out.trim(),
            format!(
                "{}/home|20123|{}|unset",
                path.display(),
                canonical.display()
            )
        );
    }

    #[tokio::test]
    async fn test_sample_usage_counts_workload_tree() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("venv");
        let engine = engine();
        let env = engine.create(&spec(path.clone(), vec![])).await.unwrap();
        fs::write(path.join("tmp/blob"), vec![0u8; 4096]).unwrap();

        let probe = UsageProbe::from(&env);
        let idle = engine.sample_usage(&probe).await.unwrap();
        assert_eq!(idle.memory_bytes, Some(0));
        assert!(idle.disk_bytes.unwrap() >= 4096);

        let cmd = engine
            .prepare_command(&env, &CommandSpec::new("sleep").arg("30"))
            .unwrap();
        engine.ctx.processes.spawn(&env.env_id, &cmd).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let busy = engine.sample_usage(&probe).await.unwrap();
        assert!(busy.memory_bytes.unwrap() > 0);

        engine
            .ctx
            .processes
            .stop_all(&env.env_id, Duration::from_secs(5))
            .await
            .unwrap();
    }
}
