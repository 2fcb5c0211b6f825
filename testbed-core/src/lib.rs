//! Testbed Core - Isolated Execution Environments for Test Workloads
//!
//! This crate manages isolated environments that host test workloads: it
//! picks an isolation engine per request, hands out conflict-free ports,
//! installs packages, watches resource usage, and tears everything down
//! again without leaking resources.
//!
//! # Design:
//! - One registry object ([`IsolationManager`]) owns every environment and is
//!   passed explicitly; there is no global state
//! - Engines form a closed set (`basic`, `process_venv`, `container`) behind
//!   one async trait and advertise what they can enforce up front
//! - Lifecycle transitions are published on an [`EventBus`] with isolated
//!   per-subscriber failure handling

pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod events;
pub mod manager;
pub mod monitor;
pub mod package;
pub mod ports;
pub mod process;
pub mod snapshot;

pub use config::{InstallerConfig, ManagerConfig};
pub use engine::resource_limits::{ResolvedLimits, ResourceLimitSpec, ResourceUsage};
pub use engine::{EngineCapability, IsolationEngine, ValidationResult};
pub use environment::{
    EnvironmentRequest, EnvironmentState, EnvironmentSummary, IsolationKind, NetworkSpec,
};
pub use error::{IsolationError, Result};
pub use events::{EventBus, EventRecord, Transition};
pub use manager::{select_isolation_kind, IsolationManager, ManagerBuilder};
pub use package::installer::{InstallReport, InstallResult, PackageInstaller, ParallelInstaller};
pub use package::{PackageManager, PackageSpec};
pub use ports::{PortAllocator, PortRange};
pub use process::{CommandSpec, ProcessHandle, ProcessManager};
pub use snapshot::{SnapshotManager, SnapshotRecord};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        info!("Initializing testbed core v{}", env!("CARGO_PKG_VERSION"));
    }
    Ok(())
}
