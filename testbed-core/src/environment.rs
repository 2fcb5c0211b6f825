//! Environment data model and the lifecycle state machine shared by every
//! isolation engine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::resource_limits::{ResolvedLimits, ResourceLimitSpec};
use crate::error::{IsolationError, Result};
use crate::package::PackageSpec;
use crate::process::ProcessHandle;

/// The closed set of isolation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// Directory sandbox with permission scoping only.
    Basic,
    /// Isolated runtime directory plus isolated process context.
    ProcessVenv,
    /// Full OS-level isolation through a container runtime.
    Container,
}

impl IsolationKind {
    pub const ALL: [IsolationKind; 3] = [Self::Basic, Self::ProcessVenv, Self::Container];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::ProcessVenv => "process_venv",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for IsolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationKind {
    type Err = IsolationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(Self::Basic),
            "process_venv" | "venv" => Ok(Self::ProcessVenv),
            "container" => Ok(Self::Container),
            other => Err(IsolationError::validation(
                None::<&str>,
                "parse_isolation_kind",
                format!("unknown isolation kind '{other}'"),
            )),
        }
    }
}

/// Lifecycle states.
///
/// ```text
/// UNINITIALIZED -> CREATING -> READY -> ACTIVE -> STOPPING -> READY
///                     |                              |
///                     +----------> FAILED <----------+
/// READY | FAILED -> DESTROYING -> DESTROYED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentState {
    Uninitialized,
    Creating,
    Ready,
    Active,
    Stopping,
    Failed,
    Destroying,
    Destroyed,
}

impl EnvironmentState {
    pub fn can_transition_to(self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;
        matches!(
            (self, next),
            (Uninitialized, Creating)
                | (Creating, Ready)
                | (Creating, Failed)
                | (Ready, Active)
                | (Ready, Destroying)
                | (Active, Stopping)
                | (Stopping, Ready)
                | (Stopping, Failed)
                | (Failed, Destroying)
                | (Destroying, Destroyed)
                | (Destroying, Failed)
        )
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Creating => "CREATING",
            Self::Ready => "READY",
            Self::Active => "ACTIVE",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
            Self::Destroying => "DESTROYING",
            Self::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// Network requirements of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    /// Ports the workload listens on inside the environment. Each one is
    /// mapped to a distinct host port from the allocator.
    pub ports: Vec<u16>,
    /// Private subnet (CIDR) for engines with their own network.
    pub subnet: Option<String>,
}

/// Declarative creation request.  This is also the config a snapshot
/// records and a migration replays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentRequest {
    pub isolation_kind: Option<IsolationKind>,
    pub resource_limits: Option<ResourceLimitSpec>,
    pub network: Option<NetworkSpec>,
    pub packages: Vec<PackageSpec>,
    /// Container image; ignored by other engines.
    pub image: Option<String>,
}

impl EnvironmentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: IsolationKind) -> Self {
        self.isolation_kind = Some(kind);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimitSpec) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.network.get_or_insert_with(NetworkSpec::default).ports = ports;
        self
    }

    pub fn with_packages(mut self, packages: Vec<PackageSpec>) -> Self {
        self.packages = packages;
        self
    }

    /// Number of host ports this request needs.
    pub fn ports_needed(&self) -> usize {
        self.network.as_ref().map_or(0, |n| n.ports.len())
    }

    pub fn has_limits(&self) -> bool {
        self.resource_limits.as_ref().is_some_and(|l| !l.is_empty())
    }

    pub fn has_network(&self) -> bool {
        self.network
            .as_ref()
            .is_some_and(|n| !n.ports.is_empty() || n.subnet.is_some())
    }
}

/// Backend-specific references an environment owns at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeHandle {
    pub container_id: Option<String>,
    pub network_id: Option<String>,
    pub image_ref: Option<String>,
    pub processes: Vec<ProcessHandle>,
}

/// One isolated execution context.  Owned by the manager's registry; engines
/// only receive it by reference for the duration of a call.
#[derive(Debug, Clone)]
pub struct Environment {
    pub env_id: String,
    pub path: PathBuf,
    pub isolation_kind: IsolationKind,
    pub state: EnvironmentState,
    pub config: EnvironmentRequest,
    pub limits: ResolvedLimits,
    pub allocated_ports: Vec<u16>,
    pub handle: RuntimeHandle,
    /// Installed packages, name -> resolved version.
    pub packages: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(
        env_id: impl Into<String>,
        path: impl Into<PathBuf>,
        isolation_kind: IsolationKind,
        config: EnvironmentRequest,
    ) -> Self {
        Self {
            env_id: env_id.into(),
            path: path.into(),
            isolation_kind,
            state: EnvironmentState::Uninitialized,
            config,
            limits: ResolvedLimits::default(),
            allocated_ports: Vec::new(),
            handle: RuntimeHandle::default(),
            packages: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Apply a state transition, rejecting edges the state machine forbids.
    pub fn transition(&mut self, next: EnvironmentState) -> Result<EnvironmentState> {
        if !self.state.can_transition_to(next) {
            return Err(IsolationError::validation(
                &self.env_id,
                format!("transition_{}", next.to_string().to_lowercase()),
                format!("illegal transition {} -> {}", self.state, next),
            ));
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Internal -> host port pairs, in request order.
    pub fn port_mappings(&self) -> Vec<(u16, u16)> {
        let internal = self
            .config
            .network
            .as_ref()
            .map(|n| n.ports.clone())
            .unwrap_or_default();
        internal
            .into_iter()
            .zip(self.allocated_ports.iter().copied())
            .collect()
    }

    pub fn summary(&self) -> EnvironmentSummary {
        EnvironmentSummary {
            env_id: self.env_id.clone(),
            path: self.path.clone(),
            isolation_kind: self.isolation_kind,
            state: self.state,
            allocated_ports: self.allocated_ports.clone(),
            container_id: self.handle.container_id.clone(),
            process_count: self.handle.processes.len(),
            packages: self.packages.clone(),
            created_at: self.created_at,
        }
    }
}

/// Read-only, point-in-time view handed to reporting layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSummary {
    pub env_id: String,
    pub path: PathBuf,
    pub isolation_kind: IsolationKind,
    pub state: EnvironmentState,
    pub allocated_ports: Vec<u16>,
    pub container_id: Option<String>,
    pub process_count: usize,
    pub packages: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}
