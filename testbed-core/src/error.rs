//! Error taxonomy for environment lifecycle operations.
//!
//! Every variant names the environment (when one had been assigned) and the
//! lifecycle step that failed, so a failure can always be attributed to a
//! specific stage of creation, activation, or teardown.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, IsolationError>;

/// Wrapper that renders an optional environment id for error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLabel(pub Option<String>);

impl fmt::Display for EnvLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => write!(f, "{id}"),
            None => write!(f, "<unassigned>"),
        }
    }
}

impl From<Option<&str>> for EnvLabel {
    fn from(value: Option<&str>) -> Self {
        Self(value.map(str::to_string))
    }
}

impl From<&str> for EnvLabel {
    fn from(value: &str) -> Self {
        Self(Some(value.to_string()))
    }
}

impl From<&String> for EnvLabel {
    fn from(value: &String) -> Self {
        Self(Some(value.clone()))
    }
}

/// A single package whose requested constraint disagrees with what is
/// already installed (or with another request in the same batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageConflict {
    pub name: String,
    pub requested: String,
    pub installed: String,
}

impl fmt::Display for PackageConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (requested {}, installed {})",
            self.name, self.requested, self.installed
        )
    }
}

#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("validation failed at '{step}' for {env_id}: {message}")]
    Validation {
        env_id: EnvLabel,
        step: String,
        message: String,
    },

    #[error("allocation failed at '{step}' for {env_id}: {message}")]
    Allocation {
        env_id: EnvLabel,
        step: String,
        message: String,
    },

    #[error("engine operation '{step}' failed for {env_id}: {source:#}")]
    EngineOperation {
        env_id: EnvLabel,
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("'{step}' timed out after {after:?} for {env_id}")]
    Timeout {
        env_id: EnvLabel,
        step: String,
        after: Duration,
    },

    #[error("package conflicts for {env_id}: {}", format_conflicts(.conflicts))]
    Conflict {
        env_id: EnvLabel,
        conflicts: Vec<PackageConflict>,
    },

    #[error("cleanup '{step}' could not reclaim resources for {env_id}: {message}{}", format_original(.original))]
    Cleanup {
        env_id: EnvLabel,
        step: String,
        message: String,
        original: Option<Box<IsolationError>>,
    },
}

fn format_conflicts(conflicts: &[PackageConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_original(original: &Option<Box<IsolationError>>) -> String {
    match original {
        Some(err) => format!(" (while rolling back: {err})"),
        None => String::new(),
    }
}

impl IsolationError {
    pub fn validation(
        env_id: impl Into<EnvLabel>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            env_id: env_id.into(),
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn allocation(
        env_id: impl Into<EnvLabel>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Allocation {
            env_id: env_id.into(),
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn engine(
        env_id: impl Into<EnvLabel>,
        step: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::EngineOperation {
            env_id: env_id.into(),
            step: step.into(),
            source: source.into(),
        }
    }

    pub fn timeout(env_id: impl Into<EnvLabel>, step: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            env_id: env_id.into(),
            step: step.into(),
            after,
        }
    }

    pub fn cleanup(
        env_id: impl Into<EnvLabel>,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Cleanup {
            env_id: env_id.into(),
            step: step.into(),
            message: message.into(),
            original: None,
        }
    }

    /// Attach the error that triggered a rollback to a cleanup failure.
    /// Non-cleanup errors are returned unchanged.
    pub fn during_rollback_of(self, original: IsolationError) -> Self {
        match self {
            Self::Cleanup {
                env_id,
                step,
                message,
                ..
            } => Self::Cleanup {
                env_id,
                step,
                message,
                original: Some(Box::new(original)),
            },
            other => other,
        }
    }

    /// The environment the error is attributed to, if one had been assigned.
    pub fn env_id(&self) -> Option<&str> {
        let label = match self {
            Self::Validation { env_id, .. }
            | Self::Allocation { env_id, .. }
            | Self::EngineOperation { env_id, .. }
            | Self::Timeout { env_id, .. }
            | Self::Conflict { env_id, .. }
            | Self::Cleanup { env_id, .. } => env_id,
        };
        label.0.as_deref()
    }

    /// The lifecycle step that failed.
    pub fn step(&self) -> &str {
        match self {
            Self::Validation { step, .. }
            | Self::Allocation { step, .. }
            | Self::EngineOperation { step, .. }
            | Self::Timeout { step, .. }
            | Self::Cleanup { step, .. } => step,
            Self::Conflict { .. } => "resolve",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::Allocation { .. })
    }

    pub fn is_cleanup(&self) -> bool {
        matches!(self, Self::Cleanup { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_env_and_step() {
        let err = IsolationError::allocation("env-000001", "allocate_ports", "pool exhausted");
        assert_eq!(err.env_id(), Some("env-000001"));
        assert_eq!(err.step(), "allocate_ports");
        assert!(err.is_allocation());
        assert!(err.to_string().contains("env-000001"));
    }

    #[test]
    fn test_unassigned_env_label() {
        let err = IsolationError::validation(None::<&str>, "parse_limits", "bad memory");
        assert_eq!(err.env_id(), None);
        assert!(err.to_string().contains("<unassigned>"));
    }

    #[test]
    fn test_rollback_failure_keeps_original() {
        let original = IsolationError::engine("env-1", "start", anyhow::anyhow!("boom"));
        let err = IsolationError::cleanup("env-1", "rollback", "dir busy").during_rollback_of(original);
        match &err {
            IsolationError::Cleanup { original, .. } => {
                assert!(original.as_ref().unwrap().to_string().contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("while rolling back"));
    }

    #[test]
    fn test_conflict_lists_every_package() {
        let err = IsolationError::Conflict {
            env_id: "env-2".into(),
            conflicts: vec![
                PackageConflict {
                    name: "flask".into(),
                    requested: "==2.0".into(),
                    installed: "1.1".into(),
                },
                PackageConflict {
                    name: "redis".into(),
                    requested: ">=5".into(),
                    installed: "4.0".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("flask"));
        assert!(text.contains("redis"));
        assert_eq!(err.step(), "resolve");
    }
}
