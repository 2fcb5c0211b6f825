//! Manager configuration.
//!
//! Everything is plain data with serde defaults so a loader can supply any
//! subset of options.  [`ManagerConfig::validate`] runs before any engine is
//! built; malformed values never reach an engine call.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::resource_limits::ResourceLimitSpec;
use crate::environment::IsolationKind;
use crate::error::{IsolationError, Result};
use crate::ports::PortRange;

/// Command template used by the default package installer.
///
/// Placeholders: `{prefix}` (install prefix inside the environment),
/// `{requirement}` (e.g. `flask==2.0.1`), `{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub program: String,
    pub install_args: Vec<String>,
    /// Optional follow-up query printing `Version: x.y.z`.
    pub version_args: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: "pip".to_string(),
            install_args: vec![
                "install".into(),
                "--disable-pip-version-check".into(),
                "--prefix".into(),
                "{prefix}".into(),
                "{requirement}".into(),
            ],
            version_args: vec!["show".into(), "{name}".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub max_environments: usize,
    /// Replaces the `basic` fallback for requests carrying no hints.
    pub default_isolation_kind: Option<IsolationKind>,
    pub default_resource_limits: ResourceLimitSpec,
    pub port_range: PortRange,
    pub container_timeout_secs: u64,
    pub pull_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub process_wait_timeout_secs: u64,
    pub stop_grace_period_secs: u64,
    pub max_parallel_installs: usize,
    pub monitor_interval_ms: u64,
    /// Fraction of a limit at which a soft-limit warning fires.
    pub soft_limit_ratio: f64,
    pub container_runtime: String,
    pub default_image: String,
    pub installer: InstallerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_environments: 16,
            default_isolation_kind: None,
            default_resource_limits: ResourceLimitSpec::default(),
            port_range: PortRange::default(),
            container_timeout_secs: 30,
            pull_timeout_secs: 300,
            install_timeout_secs: 120,
            process_wait_timeout_secs: 30,
            stop_grace_period_secs: 10,
            max_parallel_installs: 4,
            monitor_interval_ms: 1000,
            soft_limit_ratio: 0.8,
            container_runtime: "docker".to_string(),
            default_image: "debian:stable-slim".to_string(),
            installer: InstallerConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Parse JSON and validate.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: ManagerConfig = serde_json::from_str(text).map_err(|e| {
            IsolationError::validation(None::<&str>, "parse_config", e.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            IsolationError::validation(
                None::<&str>,
                "read_config",
                format!("{}: {e}", path.display()),
            )
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| {
            Err(IsolationError::validation(None::<&str>, "validate_config", message))
        };

        if self.max_environments == 0 {
            return fail("max_environments must be at least 1".into());
        }
        if self.port_range.start == 0 || self.port_range.is_empty() {
            return fail(format!(
                "port_range {}-{} is empty or starts at 0",
                self.port_range.start, self.port_range.end
            ));
        }
        for (name, value) in [
            ("container_timeout_secs", self.container_timeout_secs),
            ("pull_timeout_secs", self.pull_timeout_secs),
            ("install_timeout_secs", self.install_timeout_secs),
            ("process_wait_timeout_secs", self.process_wait_timeout_secs),
            ("monitor_interval_ms", self.monitor_interval_ms),
        ] {
            if value == 0 {
                return fail(format!("{name} must be greater than zero"));
            }
        }
        if self.max_parallel_installs == 0 {
            return fail("max_parallel_installs must be at least 1".into());
        }
        if !(self.soft_limit_ratio > 0.0 && self.soft_limit_ratio <= 1.0) {
            return fail(format!(
                "soft_limit_ratio must be in (0, 1], got {}",
                self.soft_limit_ratio
            ));
        }
        if self.container_runtime.trim().is_empty() {
            return fail("container_runtime must name a program".into());
        }
        if self.default_image.trim().is_empty() {
            return fail("default_image must not be empty".into());
        }
        if self.installer.program.trim().is_empty() {
            return fail("installer.program must name a program".into());
        }
        self.default_resource_limits.resolve(None)?;
        Ok(())
    }

    pub fn container_timeout(&self) -> Duration {
        Duration::from_secs(self.container_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn process_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.process_wait_timeout_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
