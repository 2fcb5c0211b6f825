//! Container engine.
//!
//! Drives a docker-compatible runtime CLI (`container_runtime` in the
//! config).  Every environment is one long-lived container with the
//! environment directory bind-mounted at `/workspace`; workloads enter it
//! through `exec`.  Memory and cpu limits are enforced by the runtime's
//! cgroups, host ports are published per mapping, and a requested subnet gets
//! its own network.
//!
//! # Design:
//! - Runtime invocations are bounded: image pulls by `pull_timeout`,
//!   everything else by `container_timeout`
//! - `create` records each produced resource and unwinds them in reverse on
//!   failure
//! - "No such ..." answers during teardown count as already removed

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::resource_limits::{parse_bytes, ResourceUsage};
use super::{
    directory_size, prepare_directory, remove_directory, rolled_back, write_metadata,
    CreateLedger, CreateSpec, CreatedResource, EngineCapability, EngineContext,
    IsolationEngine, UsageProbe, ValidationResult,
};
use crate::environment::{Environment, IsolationKind};
use crate::error::{IsolationError, Result};
use crate::process::CommandSpec;

/// Mount point of the environment directory inside the container.
pub const WORKSPACE: &str = "/workspace";
const LABEL: &str = "testbed.env";

struct RuntimeOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl RuntimeOutput {
    fn is_missing(&self) -> bool {
        self.stderr.contains("No such") || self.stderr.contains("not found")
    }
}

pub struct ContainerEngine {
    ctx: EngineContext,
}

impl ContainerEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    fn runtime(&self) -> &str {
        &self.ctx.config.container_runtime
    }

    /// Run the runtime CLI; fails only if it cannot be started or overruns.
    async fn invoke(
        &self,
        env_id: &str,
        step: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RuntimeOutput> {
        debug!(env_id, step, runtime = self.runtime(), ?args, "Invoking container runtime");
        let child = Command::new(self.runtime())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(output) => output
                .with_context(|| format!("cannot run '{}'", self.runtime()))
                .map_err(|e| IsolationError::engine(env_id, step, e))?,
            Err(_) => return Err(IsolationError::timeout(env_id, step, timeout)),
        };
        Ok(RuntimeOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run the runtime CLI and require success; returns trimmed stdout.
    async fn run(&self, env_id: &str, step: &str, args: &[String], timeout: Duration) -> Result<String> {
        let output = self.invoke(env_id, step, args, timeout).await?;
        if !output.success {
            return Err(IsolationError::engine(
                env_id,
                step,
                anyhow::anyhow!("{} {} failed: {}", self.runtime(), args.join(" "), output.stderr),
            ));
        }
        Ok(output.stdout)
    }

    async fn ensure_image(&self, env_id: &str, image: &str) -> Result<()> {
        let local = self
            .invoke(
                env_id,
                "inspect_image",
                &args(["image", "inspect", image]),
                self.ctx.config.container_timeout(),
            )
            .await?;
        if local.success {
            return Ok(());
        }
        info!(env_id, image, "Pulling image");
        self.run(env_id, "pull_image", &args(["pull", image]), self.ctx.config.pull_timeout())
            .await
            .map(|_| ())
    }

    fn create_args(&self, spec: &CreateSpec, env: &Environment, image: &str, network: Option<&str>) -> Vec<String> {
        let mut out = args([
            "create",
            "--name",
            &container_name(&spec.env_id),
            "--label",
            &format!("{LABEL}={}", spec.env_id),
            "-v",
            &format!("{}:{WORKSPACE}", spec.path.display()),
            "-w",
            WORKSPACE,
        ]);
        if let Some(network) = network {
            out.push("--network".into());
            out.push(network.into());
        }
        for (internal, host) in env.port_mappings() {
            out.push("-p".into());
            out.push(format!("{host}:{internal}"));
        }
        out.extend(
            spec.limits
                .to_batch(self.ctx.config.soft_limit_ratio)
                .to_runtime_args(),
        );
        out.extend(args([image, "sleep", "infinity"]));
        out
    }

    async fn build(&self, spec: &CreateSpec, ledger: &mut CreateLedger) -> Result<Environment> {
        if prepare_directory(&spec.env_id, &spec.path)? {
            ledger.record(CreatedResource::Directory(spec.path.clone()));
        }

        let mut env = spec.new_environment(self.kind());
        let image = spec
            .config
            .image
            .clone()
            .unwrap_or_else(|| self.ctx.config.default_image.clone());
        self.ensure_image(&spec.env_id, &image).await?;

        let timeout = self.ctx.config.container_timeout();
        let subnet = spec.config.network.as_ref().and_then(|n| n.subnet.clone());
        if let Some(subnet) = subnet {
            let name = network_name(&spec.env_id);
            // Recorded first: a timed-out create may still have succeeded.
            ledger.record(CreatedResource::Network(name.clone()));
            self.run(
                &spec.env_id,
                "create_network",
                &args(["network", "create", "--subnet", &subnet, &name]),
                timeout,
            )
            .await?;
            env.handle.network_id = Some(name);
        }

        let create = self.create_args(spec, &env, &image, env.handle.network_id.as_deref());
        // The name is deterministic, so rollback can remove a container the
        // runtime finished creating after we stopped waiting.
        ledger.record(CreatedResource::Container(container_name(&spec.env_id)));
        let container_id = self
            .run(&spec.env_id, "create_container", &create, timeout)
            .await?;
        if container_id.is_empty() {
            return Err(IsolationError::engine(
                &spec.env_id,
                "create_container",
                anyhow::anyhow!("runtime returned no container id"),
            ));
        }
        env.handle.container_id = Some(container_id.clone());

        let image_ref = self
            .run(
                &spec.env_id,
                "inspect_container",
                &args(["inspect", "--format", "{{.Image}}", &container_id]),
                timeout,
            )
            .await?;
        env.handle.image_ref = Some(image_ref);
        write_metadata(&env)?;
        Ok(env)
    }

    async fn remove_container(&self, env_id: &str, id: &str, force: bool) -> Result<()> {
        let mut rm = args(["rm"]);
        if force {
            rm.push("-f".into());
        }
        rm.push(id.into());
        let output = self
            .invoke(env_id, "remove_container", &rm, self.ctx.config.container_timeout())
            .await
            .map_err(|e| IsolationError::cleanup(env_id, "remove_container", e.to_string()))?;
        if output.success || output.is_missing() {
            return Ok(());
        }
        Err(IsolationError::cleanup(env_id, "remove_container", output.stderr))
    }

    async fn remove_network(&self, env_id: &str, name: &str) -> Result<()> {
        let output = self
            .invoke(
                env_id,
                "remove_network",
                &args(["network", "rm", name]),
                self.ctx.config.container_timeout(),
            )
            .await
            .map_err(|e| IsolationError::cleanup(env_id, "remove_network", e.to_string()))?;
        if output.success || output.is_missing() {
            return Ok(());
        }
        Err(IsolationError::cleanup(env_id, "remove_network", output.stderr))
    }

    async fn unwind(&self, env_id: &str, ledger: &mut CreateLedger) -> Result<()> {
        for resource in ledger.unwind_order() {
            match resource {
                CreatedResource::Container(id) => self.remove_container(env_id, &id, true).await?,
                CreatedResource::Network(name) => self.remove_network(env_id, &name).await?,
                CreatedResource::Directory(path) => remove_directory(env_id, &path)?,
            }
        }
        Ok(())
    }

    fn container_id<'a>(&self, env: &'a Environment, step: &str) -> Result<&'a str> {
        env.handle.container_id.as_deref().ok_or_else(|| {
            IsolationError::validation(&env.env_id, step, "environment has no container")
        })
    }
}

#[async_trait]
impl IsolationEngine for ContainerEngine {
    fn kind(&self) -> IsolationKind {
        IsolationKind::Container
    }

    fn capabilities(&self) -> EngineCapability {
        EngineCapability {
            supports_resource_limits: true,
            supports_networking: true,
            supports_private_network: true,
            relative_cost_weight: 10,
        }
    }

    async fn create(&self, spec: &CreateSpec) -> Result<Environment> {
        self.capabilities()
            .check(Some(spec.env_id.as_str()), self.kind(), &spec.config, &spec.limits)?;

        let mut ledger = CreateLedger::default();
        match self.build(spec, &mut ledger).await {
            Ok(env) => {
                info!(
                    env_id = %spec.env_id,
                    container = env.handle.container_id.as_deref().unwrap_or_default(),
                    ports = ?spec.ports,
                    "Created container environment"
                );
                Ok(env)
            }
            Err(e) => {
                warn!(env_id = %spec.env_id, step = e.step(), error = %e, "Container create failed, rolling back");
                let rollback = self.unwind(&spec.env_id, &mut ledger).await;
                rolled_back(e, rollback)
            }
        }
    }

    async fn activate(&self, env: &mut Environment) -> Result<bool> {
        let id = self.container_id(env, "start_container")?.to_string();
        self.run(
            &env.env_id,
            "start_container",
            &args(["start", &id]),
            self.ctx.config.container_timeout(),
        )
        .await?;
        debug!(env_id = %env.env_id, container = %id, "Container started");
        Ok(true)
    }

    async fn deactivate(&self, env: &mut Environment) -> Result<bool> {
        let grace = self.ctx.config.stop_grace_period();
        self.ctx.processes.stop_all(&env.env_id, grace).await?;
        env.handle.processes.clear();

        let id = self.container_id(env, "stop_container")?.to_string();
        self.run(
            &env.env_id,
            "stop_container",
            &args(["stop", "-t", &grace.as_secs().to_string(), &id]),
            grace + self.ctx.config.container_timeout(),
        )
        .await?;
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
                return Err(IsolationError::cleanup(&env.env_id, "stop_processes", e.to_string()));
            }
            warn!(env_id = %env.env_id, error = %e, "Ignoring process stop failure");
        }
        env.handle.processes.clear();

        if let Some(id) = env.handle.container_id.clone() {
            self.remove_container(&env.env_id, &id, force).await?;
            env.handle.container_id = None;
        }
        if let Some(name) = env.handle.network_id.clone() {
            self.remove_network(&env.env_id, &name).await?;
            env.handle.network_id = None;
        }
        remove_directory(&env.env_id, &env.path)?;
        info!(env_id = %env.env_id, "Removed container environment");
        Ok(true)
    }

    async fn validate(&self, env: &Environment) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if !env.path.is_dir() {
            result.issue(format!("{} is missing", env.path.display()));
        }
        let Some(id) = env.handle.container_id.as_deref() else {
            result.issue("environment has no container");
            return result;
        };
        match self
            .invoke(
                &env.env_id,
                "inspect_container",
                &args(["inspect", "--format", "{{.State.Status}}", id]),
                self.ctx.config.container_timeout(),
            )
            .await
        {
            Ok(output) if output.success => {}
            Ok(output) => result.issue(format!("container {id}: {}", output.stderr)),
            Err(e) => result.issue(e.to_string()),
        }
        result
    }

    fn prepare_command(&self, env: &Environment, command: &CommandSpec) -> Result<CommandSpec> {
        let id = self.container_id(env, "prepare_command")?;
        let mut exec = args(["exec", "-w", WORKSPACE, "-e"]);
        exec.push(format!("TESTBED_ENV_ID={}", env.env_id));
        for (key, value) in &command.env {
            exec.push("-e".into());
            exec.push(format!("{key}={value}"));
        }
        exec.push(id.to_string());
        exec.push(command.program.clone());
        exec.extend(command.args.iter().cloned());

        Ok(CommandSpec {
            program: self.runtime().to_string(),
            args: exec,
            cwd: None,
            env: Default::default(),
            clear_env: false,
            new_process_group: true,
        })
    }

    fn package_prefix(&self, _env: &Environment) -> PathBuf {
        PathBuf::from(WORKSPACE).join(".testbed").join("packages")
    }

    async fn sample_usage(&self, probe: &UsageProbe) -> Result<ResourceUsage> {
        let id = probe.container_id.as_deref().ok_or_else(|| {
            IsolationError::validation(&probe.env_id, "sample_usage", "environment has no container")
        })?;
        let stats = self
            .run(
                &probe.env_id,
                "sample_usage",
                &args(["stats", "--no-stream", "--format", "{{.CPUPerc}}|{{.MemUsage}}", id]),
                self.ctx.config.container_timeout(),
            )
            .await?;
        let mut usage = parse_stats(&stats).ok_or_else(|| {
            IsolationError::engine(
                &probe.env_id,
                "sample_usage",
                anyhow::anyhow!("unrecognised stats line '{stats}'"),
            )
        })?;
        usage.disk_bytes = Some(directory_size(&probe.path));
        Ok(usage)
    }

    fn image_reference(&self, env: &Environment) -> Option<String> {
        env.handle.image_ref.clone()
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn container_name(env_id: &str) -> String {
    format!("testbed-{env_id}")
}

fn network_name(env_id: &str) -> String {
    format!("testbed-net-{env_id}")
}

/// Parse `12.50%|64MiB / 1GiB`.
fn parse_stats(line: &str) -> Option<ResourceUsage> {
    let (cpu, memory) = line.lines().next()?.split_once('|')?;
    let cpu: f64 = cpu.trim().trim_end_matches('%').parse().ok()?;
    let used = memory.split('/').next()?.trim();
    Some(ResourceUsage {
        memory_bytes: Some(parse_bytes(used).ok()?),
        cpu_cores: Some(cpu / 100.0),
        disk_bytes: None,
    })
}
