//! Isolation Manager - Environment Registry and Orchestration
//!
//! The manager owns every environment.  It selects an engine per request,
//! enforces the capacity ceiling, hands out ports, and drives each
//! environment through the shared lifecycle state machine, publishing one
//! event per transition.
//!
//! # Design:
//! - Registry mutations (capacity check, id assignment, port reservation,
//!   entry removal) happen inside one short critical section; slow engine
//!   work happens outside it, holding only that environment's lock
//! - Each environment has its own async lock, so its transitions are
//!   totally ordered while different environments proceed independently
//! - Background work for an environment (resource monitor, live package
//!   installs) runs on its task tracker under its cancellation token;
//!   teardown cancels the token and waits for the tracker before removing
//!   the registry entry

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::engine::resource_limits::{ResolvedLimits, ResourceKind, ResourceLimitSpec};
use crate::engine::{
    default_engine, CreateSpec, EngineCapability, EngineContext, EngineFactory, IsolationEngine,
    UsageProbe, ValidationResult,
};
use crate::environment::{
    Environment, EnvironmentRequest, EnvironmentState, EnvironmentSummary, IsolationKind,
};
use crate::error::{IsolationError, Result};
use crate::events::{EventBus, EventRecord, Transition};
use crate::monitor::{MonitorHandle, ResourceMonitor, ViolationHandler};
use crate::package::installer::{
    CommandInstaller, InstallOutcome, InstallReport, InstallTarget, PackageInstaller,
    ParallelInstaller,
};
use crate::package::{PackageManager, PackageManifest, PackageSpec};
use crate::ports::PortAllocator;
use crate::process::{CommandSpec, ExitInfo, ProcessHandle, ProcessManager};
use crate::snapshot::SnapshotManager;

/// Cleanup attempts for a forced destroy.
const FORCED_CLEANUP_ATTEMPTS: usize = 3;

/// Pick the engine for `request`.
///
/// Memory or cpu limits always escalate to `container`, the only engine with
/// hard enforcement.  Otherwise an explicit kind is honoured; a request with
/// no limits, network or kind at all gets `basic` (or `default_kind` when
/// configured); everything else gets `process_venv`.
pub fn select_isolation_kind(
    request: &EnvironmentRequest,
    default_kind: Option<IsolationKind>,
) -> IsolationKind {
    if request
        .resource_limits
        .as_ref()
        .is_some_and(ResourceLimitSpec::requires_enforcement)
    {
        return IsolationKind::Container;
    }
    if let Some(kind) = request.isolation_kind {
        return kind;
    }
    if !request.has_limits() && !request.has_network() {
        return default_kind.unwrap_or(IsolationKind::Basic);
    }
    IsolationKind::ProcessVenv
}

/// One registry entry.
struct EnvSlot {
    env: Arc<AsyncMutex<Environment>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    monitor: Mutex<Option<MonitorHandle>>,
    summary: RwLock<EnvironmentSummary>,
}

impl EnvSlot {
    fn new(env: Environment) -> Self {
        Self {
            summary: RwLock::new(env.summary()),
            env: Arc::new(AsyncMutex::new(env)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            monitor: Mutex::new(None),
        }
    }

    fn refresh(&self, env: &Environment) {
        *self.summary.write().unwrap_or_else(PoisonError::into_inner) = env.summary();
    }

    fn summary(&self) -> EnvironmentSummary {
        self.summary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_monitor(&self) -> Option<MonitorHandle> {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[derive(Default)]
struct Registry {
    environments: HashMap<String, Arc<EnvSlot>>,
    next_id: u64,
}

struct ManagerInner {
    config: Arc<ManagerConfig>,
    engines: BTreeMap<IsolationKind, Arc<dyn IsolationEngine>>,
    registry: Mutex<Registry>,
    ports: PortAllocator,
    processes: Arc<ProcessManager>,
    events: Arc<EventBus>,
    monitor: ResourceMonitor,
    packages: PackageManager,
    snapshots: SnapshotManager,
    shutdown: CancellationToken,
}

/// Builds an [`IsolationManager`], optionally overriding engines and the
/// package installer.
pub struct ManagerBuilder {
    config: ManagerConfig,
    engines: BTreeMap<IsolationKind, EngineFactory>,
    installer: Option<Arc<dyn PackageInstaller>>,
    events: Option<Arc<EventBus>>,
    probe_ports: bool,
}

impl ManagerBuilder {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            engines: BTreeMap::new(),
            installer: None,
            events: None,
            probe_ports: true,
        }
    }

    /// Register the factory used for `kind` instead of the built-in engine.
    pub fn engine<F>(mut self, kind: IsolationKind, factory: F) -> Self
    where
        F: Fn(&EngineContext) -> Arc<dyn IsolationEngine> + Send + Sync + 'static,
    {
        self.engines.insert(kind, Arc::new(factory));
        self
    }

    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Skip the bind probe when allocating ports.
    pub fn without_port_probe(mut self) -> Self {
        self.probe_ports = false;
        self
    }

    pub fn build(self) -> Result<IsolationManager> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let processes = Arc::new(ProcessManager::new());
        let events = self.events.unwrap_or_default();
        let ctx = EngineContext {
            config: Arc::clone(&config),
            processes: Arc::clone(&processes),
        };

        let engines: BTreeMap<_, _> = IsolationKind::ALL
            .into_iter()
            .map(|kind| {
                let engine = match self.engines.get(&kind) {
                    Some(factory) => factory(&ctx),
                    None => default_engine(kind, &ctx),
                };
                (kind, engine)
            })
            .collect();
        for (kind, engine) in &engines {
            if engine.kind() != *kind {
                return Err(IsolationError::validation(
                    None::<&str>,
                    "register_engine",
                    format!("factory for {kind} built a {} engine", engine.kind()),
                ));
            }
        }

        let installer = self.installer.unwrap_or_else(|| {
            Arc::new(CommandInstaller::new(
                config.installer.clone(),
                Arc::clone(&processes),
                config.install_timeout(),
            ))
        });
        let packages = PackageManager::new(
            ParallelInstaller::new(installer, config.install_timeout()),
            config.max_parallel_installs,
        );
        let mut ports = PortAllocator::new(config.port_range);
        if !self.probe_ports {
            ports = ports.without_probe();
        }
        let monitor = ResourceMonitor::new(
            config.monitor_interval(),
            config.soft_limit_ratio,
            Arc::clone(&events),
        );

        info!(
            max_environments = config.max_environments,
            port_range = %format!("{}-{}", config.port_range.start, config.port_range.end),
            engines = engines.len(),
            "Isolation manager ready"
        );
        Ok(IsolationManager {
            inner: Arc::new(ManagerInner {
                config,
                engines,
                registry: Mutex::new(Registry::default()),
                ports,
                processes,
                events,
                monitor,
                packages,
                snapshots: SnapshotManager::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// Registry of environments and their engines.  Cheap to clone; clones
/// share the same registry.
#[derive(Clone)]
pub struct IsolationManager {
    inner: Arc<ManagerInner>,
}

impl IsolationManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        ManagerBuilder::new(config).build()
    }

    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.events)
    }

    pub fn processes(&self) -> Arc<ProcessManager> {
        Arc::clone(&self.inner.processes)
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.inner.snapshots
    }

    pub fn capabilities(&self) -> BTreeMap<IsolationKind, EngineCapability> {
        self.inner
            .engines
            .iter()
            .map(|(kind, engine)| (*kind, engine.capabilities()))
            .collect()
    }

    /// Create an environment at `path`, engine chosen from the request.
    pub async fn create_environment(
        &self,
        path: impl Into<PathBuf>,
        request: EnvironmentRequest,
    ) -> Result<EnvironmentSummary> {
        self.create_as(path.into(), request, None).await
    }

    /// Create with `forced` bypassing auto-selection (migration, restore).
    pub(crate) async fn create_as(
        &self,
        path: PathBuf,
        request: EnvironmentRequest,
        forced: Option<IsolationKind>,
    ) -> Result<EnvironmentSummary> {
        if self.inner.shutdown.is_cancelled() {
            return Err(IsolationError::validation(
                None::<&str>,
                "create_environment",
                "manager is shut down",
            ));
        }
        let (kind, engine, limits) = self.plan(&request, forced)?;

        let (slot, mut env) = self.register(kind, &path, &request)?;
        let env_id = env.env_id.clone();
        self.publish(&env, Transition::Creating, json!({ "kind": kind }));
        info!(
            env_id = %env_id,
            kind = %kind,
            path = %path.display(),
            ports = ?env.allocated_ports,
            "Creating environment"
        );

        let spec = CreateSpec {
            path,
            env_id: env_id.clone(),
            config: request.clone(),
            limits,
            ports: env.allocated_ports.clone(),
        };
        match engine.create(&spec).await {
            Ok(created) => {
                *env = created;
                slot.refresh(&env);
            }
            // The engine has already unwound its own partial work.
            Err(e) => return self.abort_create(&slot, &mut env, e, Ok(())),
        }

        if !request.packages.is_empty() {
            if let Err(e) = self
                .install_during_create(&engine, &mut env, &request.packages)
                .await
            {
                let rollback = engine.cleanup(&mut env, true).await.map(|_| ());
                return self.abort_create(&slot, &mut env, e, rollback);
            }
        }

        self.set_state(&slot, &mut env, EnvironmentState::Ready)?;
        info!(env_id = %env_id, kind = %kind, "Environment ready");
        Ok(env.summary())
    }

    /// Validate a request and resolve its engine and limits.  Nothing is
    /// allocated; errors carry no environment id.
    fn plan(
        &self,
        request: &EnvironmentRequest,
        forced: Option<IsolationKind>,
    ) -> Result<(IsolationKind, Arc<dyn IsolationEngine>, ResolvedLimits)> {
        let requested = request.resource_limits.clone().unwrap_or_default();
        requested.resolve(None)?;
        for package in &request.packages {
            package.constraint()?;
        }
        if let Some(network) = &request.network {
            let mut seen = HashSet::new();
            for port in &network.ports {
                if *port == 0 || !seen.insert(*port) {
                    return Err(IsolationError::validation(
                        None::<&str>,
                        "validate_network",
                        format!("internal port {port} is zero or repeated"),
                    ));
                }
            }
        }

        let kind = forced.unwrap_or_else(|| {
            select_isolation_kind(request, self.inner.config.default_isolation_kind)
        });
        let engine = self.engine(kind)?;
        let capability = engine.capabilities();
        let effective = if capability.supports_resource_limits {
            requested.merged_with(&self.inner.config.default_resource_limits)
        } else {
            requested
        };
        let limits = effective.resolve(None)?;
        capability.check(None, kind, request, &limits)?;
        Ok((kind, engine, limits))
    }

    /// Reserve a registry slot and the request's ports in one critical
    /// section.  The returned guard is held until creation finishes.
    fn register(
        &self,
        kind: IsolationKind,
        path: &Path,
        request: &EnvironmentRequest,
    ) -> Result<(Arc<EnvSlot>, OwnedMutexGuard<Environment>)> {
        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let max = self.inner.config.max_environments;
        if registry.environments.len() >= max {
            return Err(IsolationError::allocation(
                None::<&str>,
                "reserve_environment",
                format!("registry holds the maximum of {max} environments"),
            ));
        }
        registry.next_id += 1;
        let env_id = format!("env-{:06}", registry.next_id);
        let ports = self.inner.ports.allocate(&env_id, request.ports_needed())?;

        let mut env = Environment::new(&env_id, path, kind, request.clone());
        env.allocated_ports = ports;
        env.transition(EnvironmentState::Creating)?;
        let slot = Arc::new(EnvSlot::new(env));
        let guard = Arc::clone(&slot.env).try_lock_owned().map_err(|e| {
            IsolationError::engine(&env_id, "reserve_environment", anyhow::anyhow!(e))
        })?;
        registry.environments.insert(env_id, Arc::clone(&slot));
        Ok((slot, guard))
    }

    /// Finish a failed creation.  With a clean rollback the environment
    /// disappears and its ports return to the pool; otherwise it stays
    /// registered as FAILED, ports held, for inspection.
    fn abort_create(
        &self,
        slot: &EnvSlot,
        env: &mut Environment,
        original: IsolationError,
        rollback: Result<()>,
    ) -> Result<EnvironmentSummary> {
        if let Err(e) = self.set_state(slot, env, EnvironmentState::Failed) {
            warn!(env_id = %env.env_id, error = %e, "Could not mark failed creation as FAILED");
        }
        let outcome = match rollback {
            Ok(()) if !original.is_cleanup() => Ok(original),
            Ok(()) => Err(original),
            Err(e) => {
                let e = if e.is_cleanup() {
                    e
                } else {
                    IsolationError::cleanup(&env.env_id, "rollback", e.to_string())
                };
                Err(e.during_rollback_of(original))
            }
        };
        match outcome {
            Ok(original) => {
                warn!(env_id = %env.env_id, step = original.step(), error = %original, "Creation failed, rolled back");
                self.inner.ports.release(&env.allocated_ports);
                self.unregister(&env.env_id);
                Err(original)
            }
            Err(cleanup) => {
                error!(env_id = %env.env_id, error = %cleanup, "Creation rollback incomplete, keeping environment as FAILED");
                Err(cleanup)
            }
        }
    }

    /// Install the request's packages while the environment is CREATING.
    /// The engine is briefly activated so commands can run inside it.
    async fn install_during_create(
        &self,
        engine: &Arc<dyn IsolationEngine>,
        env: &mut Environment,
        specs: &[PackageSpec],
    ) -> Result<()> {
        let resolved = self
            .inner
            .packages
            .resolve(&env.env_id, &env.packages, specs)?;
        engine.activate(env).await?;
        let target = install_target(engine, env);
        let report = self
            .inner
            .packages
            .install(&target, &resolved, &self.inner.shutdown)
            .await;
        engine.deactivate(env).await?;
        self.record_install(env, &resolved, &report)
    }

    /// Fold an install report into the environment and its manifest.
    fn record_install(
        &self,
        env: &mut Environment,
        resolved: &[PackageSpec],
        report: &InstallReport,
    ) -> Result<()> {
        for spec in resolved {
            if let Some(version) = &spec.resolved_version {
                env.packages.insert(spec.name.clone(), version.clone());
            }
        }
        // Record what did install even when siblings failed, so later
        // resolution sees it.
        let mut installed = 0;
        for spec in report.results.iter().filter_map(|r| r.resolved()) {
            if let Some(version) = spec.resolved_version {
                env.packages.insert(spec.name, version);
                installed += 1;
            }
        }
        PackageManifest {
            packages: env.packages.clone(),
        }
        .save(&env.path)
        .map_err(|e| IsolationError::engine(&env.env_id, "write_manifest", e))?;

        if installed > 0 {
            self.publish(
                env,
                Transition::PackagesInstalled,
                json!({ "installed": installed, "packages": env.packages }),
            );
        }

        let failures = report.failures();
        if !failures.is_empty() {
            let detail = failures
                .iter()
                .map(|r| match &r.outcome {
                    InstallOutcome::Failed { message } => format!("{}: {message}", r.package.name),
                    _ => format!("{}: cancelled", r.package.name),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(IsolationError::engine(
                &env.env_id,
                "install_packages",
                anyhow::anyhow!(detail),
            ));
        }
        Ok(())
    }

    pub async fn activate_environment(&self, env_id: &str) -> Result<bool> {
        let (slot, mut env) = self.locked(env_id).await?;
        if env.state == EnvironmentState::Active {
            return Ok(true);
        }
        ensure_transition(&env, EnvironmentState::Active)?;
        let engine = self.engine(env.isolation_kind)?;
        engine.activate(&mut env).await?;
        self.set_state(&slot, &mut env, EnvironmentState::Active)?;

        let monitor = self.inner.monitor.start(
            Arc::clone(&engine),
            UsageProbe::from(&*env),
            env.limits,
            &slot.cancel,
            &slot.tasks,
            self.violation_handler(),
        );
        if monitor.is_some() {
            debug!(env_id, "Resource monitor attached");
        }
        *slot.monitor.lock().unwrap_or_else(PoisonError::into_inner) = monitor;
        Ok(true)
    }

    pub async fn deactivate_environment(&self, env_id: &str) -> Result<bool> {
        let (slot, mut env) = self.locked(env_id).await?;
        self.deactivate_locked(&slot, &mut env).await
    }

    async fn deactivate_locked(&self, slot: &EnvSlot, env: &mut Environment) -> Result<bool> {
        if env.state != EnvironmentState::Active {
            return Ok(true);
        }
        self.set_state(slot, env, EnvironmentState::Stopping)?;
        if let Some(monitor) = slot.take_monitor() {
            monitor.stop().await;
        }
        let engine = self.engine(env.isolation_kind)?;
        match engine.deactivate(env).await {
            Ok(_) => {
                self.set_state(slot, env, EnvironmentState::Ready)?;
                Ok(true)
            }
            Err(e) => {
                self.set_state(slot, env, EnvironmentState::Failed)?;
                Err(e)
            }
        }
    }

    /// Tear an environment down.
    ///
    /// Without `force` a failed cleanup leaves the entry registered as
    /// FAILED.  With `force` cleanup is retried, and if it still fails the
    /// entry is removed anyway, its ports quarantined, and the failure
    /// returned as a residual-resource report.
    pub async fn destroy_environment(&self, env_id: &str, force: bool) -> Result<bool> {
        let (slot, mut env) = self.locked(env_id).await?;
        if env.state == EnvironmentState::Active {
            if let Err(e) = self.deactivate_locked(&slot, &mut env).await {
                if !force {
                    return Err(e);
                }
                warn!(env_id, error = %e, "Deactivation failed, forcing destroy");
            }
        }
        self.set_state(&slot, &mut env, EnvironmentState::Destroying)?;

        slot.cancel.cancel();
        if let Some(monitor) = slot.take_monitor() {
            monitor.stop().await;
        }
        slot.tasks.close();
        slot.tasks.wait().await;

        let engine = self.engine(env.isolation_kind)?;
        let attempts = if force { FORCED_CLEANUP_ATTEMPTS } else { 1 };
        let mut failure = None;
        for attempt in 1..=attempts {
            match engine.cleanup(&mut env, force).await {
                Ok(_) => {
                    failure = None;
                    break;
                }
                Err(e) => {
                    warn!(env_id, attempt, attempts, error = %e, "Cleanup attempt failed");
                    failure = Some(e);
                }
            }
        }

        let Some(e) = failure else {
            self.set_state(&slot, &mut env, EnvironmentState::Destroyed)?;
            self.inner.ports.release(&env.allocated_ports);
            self.unregister(env_id);
            info!(env_id, "Environment destroyed");
            return Ok(true);
        };

        let e = if e.is_cleanup() {
            e
        } else {
            IsolationError::cleanup(env_id, "cleanup", e.to_string())
        };
        self.set_state(&slot, &mut env, EnvironmentState::Failed)?;
        if !force {
            error!(env_id, error = %e, "Cleanup failed, environment kept as FAILED");
            return Err(e);
        }
        warn!(
            env_id,
            ports = ?env.allocated_ports,
            container = ?env.handle.container_id,
            error = %e,
            "Force-removed environment with residual resources"
        );
        self.inner.ports.quarantine(&env.allocated_ports);
        self.unregister(env_id);
        Err(e)
    }

    /// Recreate an environment under `target` from its declarative config.
    /// Live runtime state is not carried over.
    pub async fn migrate(&self, env_id: &str, target: IsolationKind) -> Result<EnvironmentSummary> {
        let (path, mut config) = {
            let (_, env) = self.locked(env_id).await?;
            (env.path.clone(), env.config.clone())
        };
        config.isolation_kind = Some(target);
        // Refuse before tearing the source down.
        self.plan(&config, Some(target))?;

        info!(env_id, target = %target, "Migrating environment");
        self.destroy_environment(env_id, false).await?;
        self.create_as(path, config, Some(target)).await
    }

    /// Spawn a workload process inside an ACTIVE environment.
    pub async fn spawn_process(&self, env_id: &str, command: &CommandSpec) -> Result<ProcessHandle> {
        let (slot, mut env) = self.locked(env_id).await?;
        if env.state != EnvironmentState::Active {
            return Err(IsolationError::validation(
                env_id,
                "spawn_process",
                format!("environment is {}, not ACTIVE", env.state),
            ));
        }
        let engine = self.engine(env.isolation_kind)?;
        let prepared = engine.prepare_command(&env, command)?;
        let handle = self.inner.processes.spawn(env_id, &prepared)?;
        env.handle.processes = self
            .inner
            .processes
            .retain_running(std::mem::take(&mut env.handle.processes));
        env.handle.processes.push(handle.clone());
        slot.refresh(&env);
        Ok(handle)
    }

    /// Wait for a workload process to exit, up to the configured
    /// `process_wait_timeout_secs`.  A timeout leaves the process running.
    pub async fn wait_process(&self, handle: &ProcessHandle) -> Result<ExitInfo> {
        self.inner
            .processes
            .wait(handle, self.inner.config.process_wait_timeout())
            .await
    }

    /// Resolve and install packages into an ACTIVE environment.
    ///
    /// The install runs on the environment's task tracker; destroying the
    /// environment meanwhile stops further packages from being dispatched.
    pub async fn install_packages(
        &self,
        env_id: &str,
        specs: Vec<PackageSpec>,
    ) -> Result<Vec<PackageSpec>> {
        let (slot, task, resolved) = {
            let (slot, env) = self.locked(env_id).await?;
            if env.state != EnvironmentState::Active || slot.cancel.is_cancelled() {
                return Err(IsolationError::validation(
                    env_id,
                    "install_packages",
                    format!("environment is {}, not ACTIVE", env.state),
                ));
            }
            let resolved = self.inner.packages.resolve(env_id, &env.packages, &specs)?;
            let engine = self.engine(env.isolation_kind)?;
            let target = install_target(&engine, &env);
            let packages = self.inner.packages.clone();
            let cancel = slot.cancel.clone();
            let pending = resolved.clone();
            let task = slot
                .tasks
                .spawn(async move { packages.install(&target, &pending, &cancel).await });
            (slot, task, resolved)
        };

        let report = task
            .await
            .map_err(|e| IsolationError::engine(env_id, "install_packages", e))?;

        let (_, mut env) = self.locked(env_id).await?;
        if slot.cancel.is_cancelled() {
            return Err(IsolationError::validation(
                env_id,
                "install_packages",
                "environment was torn down during the install",
            ));
        }
        let recorded = self.record_install(&mut env, &resolved, &report);
        let landed: Vec<PackageSpec> = specs
            .iter()
            .filter(|s| env.packages.contains_key(&s.name))
            .cloned()
            .collect();
        for spec in landed {
            env.config.packages.retain(|p| p.name != spec.name);
            env.config.packages.push(spec);
        }
        slot.refresh(&env);
        recorded?;

        Ok(resolved
            .into_iter()
            .map(|mut spec| {
                spec.resolved_version = env.packages.get(&spec.name).cloned();
                spec
            })
            .collect())
    }

    /// Run the owning engine's health check.
    pub async fn validate_environment(&self, env_id: &str) -> Result<ValidationResult> {
        let (_, env) = self.locked(env_id).await?;
        Ok(self.engine(env.isolation_kind)?.validate(&env).await)
    }

    /// Point-in-time copies of every registered environment, by id.
    pub fn list_environments(&self) -> Vec<EnvironmentSummary> {
        let slots: Vec<Arc<EnvSlot>> = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .environments
            .values()
            .cloned()
            .collect();
        let mut summaries: Vec<_> = slots.iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.env_id.cmp(&b.env_id));
        summaries
    }

    pub fn describe(&self, env_id: &str) -> Option<EnvironmentSummary> {
        self.slot(env_id).ok().map(|s| s.summary())
    }

    pub fn len(&self) -> usize {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .environments
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new environments and force-destroy the remaining ones.
    /// Returns the residual errors, if any.
    pub async fn shutdown(&self) -> Vec<IsolationError> {
        self.inner.shutdown.cancel();
        let ids: Vec<String> = self
            .list_environments()
            .into_iter()
            .map(|s| s.env_id)
            .collect();
        info!(environments = ids.len(), "Shutting down isolation manager");
        let mut residual = Vec::new();
        for env_id in ids {
            if let Err(e) = self.destroy_environment(&env_id, true).await {
                residual.push(e);
            }
        }
        residual
    }

    pub(crate) async fn with_environment<T>(
        &self,
        env_id: &str,
        f: impl FnOnce(&Environment, &dyn IsolationEngine) -> Result<T>,
    ) -> Result<T> {
        let (_, env) = self.locked(env_id).await?;
        let engine = self.engine(env.isolation_kind)?;
        f(&*env, engine.as_ref())
    }

    /// Lock an environment, confirming it is still registered once the
    /// lock is held.
    async fn locked(&self, env_id: &str) -> Result<(Arc<EnvSlot>, OwnedMutexGuard<Environment>)> {
        let slot = self.slot(env_id)?;
        let env = Arc::clone(&slot.env).lock_owned().await;
        match self.slot(env_id) {
            Ok(current) if Arc::ptr_eq(&current, &slot) => Ok((slot, env)),
            _ => Err(IsolationError::validation(
                env_id,
                "lookup_environment",
                "environment was removed",
            )),
        }
    }

    fn slot(&self, env_id: &str) -> Result<Arc<EnvSlot>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .environments
            .get(env_id)
            .cloned()
            .ok_or_else(|| {
                IsolationError::validation(env_id, "lookup_environment", "no such environment")
            })
    }

    fn unregister(&self, env_id: &str) {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .environments
            .remove(env_id);
    }

    fn engine(&self, kind: IsolationKind) -> Result<Arc<dyn IsolationEngine>> {
        self.inner.engines.get(&kind).cloned().ok_or_else(|| {
            IsolationError::validation(
                None::<&str>,
                "select_engine",
                format!("no engine registered for {kind}"),
            )
        })
    }

    fn set_state(
        &self,
        slot: &EnvSlot,
        env: &mut Environment,
        next: EnvironmentState,
    ) -> Result<()> {
        let previous = env.transition(next)?;
        slot.refresh(env);
        debug!(env_id = %env.env_id, from = %previous, to = %next, "State transition");
        if let Some(transition) = Transition::entering(next) {
            self.publish(env, transition, json!({ "from": previous }));
        }
        Ok(())
    }

    fn publish(&self, env: &Environment, transition: Transition, payload: serde_json::Value) {
        self.inner
            .events
            .publish(&EventRecord::new(&env.env_id, transition).with_payload(payload));
    }

    fn violation_handler(&self) -> ViolationHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |env_id: &str, kinds: &[ResourceKind]| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = IsolationManager { inner };
            let env_id = env_id.to_string();
            warn!(env_id = %env_id, resources = ?kinds, "Deactivating environment after limit violation");
            tokio::spawn(async move {
                if let Err(e) = manager.deactivate_environment(&env_id).await {
                    warn!(env_id = %env_id, error = %e, "Deactivation after violation failed");
                }
            });
        })
    }
}

fn ensure_transition(env: &Environment, next: EnvironmentState) -> Result<()> {
    if env.state.can_transition_to(next) {
        return Ok(());
    }
    Err(IsolationError::validation(
        &env.env_id,
        format!("transition_{}", next.to_string().to_lowercase()),
        format!("illegal transition {} -> {}", env.state, next),
    ))
}

fn install_target(engine: &Arc<dyn IsolationEngine>, env: &Environment) -> InstallTarget {
    let prefix = engine.package_prefix(env);
    let engine = Arc::clone(engine);
    let snapshot = env.clone();
    InstallTarget {
        env_id: env.env_id.clone(),
        prefix,
        wrap: Arc::new(move |command: CommandSpec| engine.prepare_command(&snapshot, &command)),
    }
}
