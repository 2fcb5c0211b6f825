//! Package specs, dependency resolution against what an environment already
//! has installed, and the on-disk manifest that records installs.

pub mod installer;
pub mod version;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IsolationError, PackageConflict, Result};
use installer::{InstallReport, InstallTarget, ParallelInstaller};
use tokio_util::sync::CancellationToken;
use version::{Version, VersionConstraint};

/// Manifest location relative to an environment directory.
pub const MANIFEST_PATH: &str = ".testbed/packages.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    #[serde(default = "any_constraint")]
    pub version_constraint: String,
    #[serde(default)]
    pub resolved_version: Option<String>,
}

fn any_constraint() -> String {
    "*".to_string()
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, version_constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_constraint: version_constraint.into(),
            resolved_version: None,
        }
    }

    /// An already-resolved package pinned to `version`.
    pub fn resolved(name: impl Into<String>, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            name: name.into(),
            version_constraint: format!("=={version}"),
            resolved_version: Some(version),
        }
    }

    pub fn constraint(&self) -> Result<VersionConstraint> {
        self.version_constraint.parse().map_err(|msg: String| {
            IsolationError::validation(None::<&str>, format!("parse_constraint:{}", self.name), msg)
        })
    }

    /// Installer requirement string, e.g. `flask>=2,<3` or `flask`.
    pub fn requirement(&self) -> String {
        let constraint = self.version_constraint.trim();
        if constraint.is_empty() || constraint == "*" {
            return self.name.clone();
        }
        if constraint.starts_with(|c: char| c.is_ascii_digit()) {
            return format!("{}=={}", self.name, constraint);
        }
        format!("{}{}", self.name, constraint)
    }
}

/// Installed packages of one environment, persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub packages: BTreeMap<String, String>,
}

impl PackageManifest {
    pub fn path_for(env_path: &Path) -> PathBuf {
        env_path.join(MANIFEST_PATH)
    }

    /// Load the manifest, or an empty one when none was written yet.
    pub fn load(env_path: &Path) -> anyhow::Result<Self> {
        let path = Self::path_for(env_path);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, env_path: &Path) -> anyhow::Result<()> {
        let path = Self::path_for(env_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Resolution and installation front end.
#[derive(Clone)]
pub struct PackageManager {
    installer: ParallelInstaller,
    max_workers: usize,
}

impl PackageManager {
    pub fn new(installer: ParallelInstaller, max_workers: usize) -> Self {
        Self {
            installer,
            max_workers,
        }
    }

    /// Check `specs` against the environment's installed set.
    ///
    /// Returns the specs in input order; those already satisfied carry their
    /// installed version in `resolved_version`, the rest still need
    /// installing.  Every mismatch is collected into a single `Conflict`.
    pub fn resolve(
        &self,
        env_id: &str,
        installed: &BTreeMap<String, String>,
        specs: &[PackageSpec],
    ) -> Result<Vec<PackageSpec>> {
        let mut conflicts = Vec::new();
        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut resolved = Vec::with_capacity(specs.len());

        for spec in specs {
            let constraint = spec.constraint().map_err(|e| match e {
                IsolationError::Validation { step, message, .. } => {
                    IsolationError::validation(env_id, step, message)
                }
                other => other,
            })?;

            if let Some(previous) = seen.insert(&spec.name, &spec.version_constraint) {
                if previous != spec.version_constraint {
                    conflicts.push(PackageConflict {
                        name: spec.name.clone(),
                        requested: spec.version_constraint.clone(),
                        installed: format!("requested as {previous} in the same batch"),
                    });
                }
                continue;
            }

            let mut out = spec.clone();
            out.resolved_version = None;
            if let Some(current) = installed.get(&spec.name) {
                let satisfied = current
                    .parse::<Version>()
                    .map(|v| constraint.matches(&v))
                    .unwrap_or(false);
                if !satisfied {
                    conflicts.push(PackageConflict {
                        name: spec.name.clone(),
                        requested: spec.version_constraint.clone(),
                        installed: current.clone(),
                    });
                    continue;
                }
                out.resolved_version = Some(current.clone());
            }
            resolved.push(out);
        }

        if !conflicts.is_empty() {
            return Err(IsolationError::Conflict {
                env_id: env_id.into(),
                conflicts,
            });
        }
        debug!(
            env_id,
            requested = specs.len(),
            pending = resolved.iter().filter(|s| s.resolved_version.is_none()).count(),
            "Resolved packages"
        );
        Ok(resolved)
    }

    /// Install every resolved spec that is not yet satisfied.
    pub async fn install(
        &self,
        target: &InstallTarget,
        resolved: &[PackageSpec],
        cancel: &CancellationToken,
    ) -> InstallReport {
        let pending: Vec<PackageSpec> = resolved
            .iter()
            .filter(|s| s.resolved_version.is_none())
            .cloned()
            .collect();
        self.installer
            .install_batch(target, pending, self.max_workers, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::installer::PackageInstaller;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct EchoInstaller;

    #[async_trait]
    impl PackageInstaller for EchoInstaller {
        async fn install(&self, _target: &InstallTarget, package: &PackageSpec) -> Result<String> {
            Ok(package
                .constraint()?
                .exact()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "9.9".to_string()))
        }
    }

    fn manager() -> PackageManager {
        PackageManager::new(
            ParallelInstaller::new(Arc::new(EchoInstaller), Duration::from_secs(5)),
            2,
        )
    }

    #[test]
    fn test_requirement_strings() {
        assert_eq!(PackageSpec::new("flask", "*").requirement(), "flask");
        assert_eq!(PackageSpec::new("flask", "2.0").requirement(), "flask==2.0");
        assert_eq!(PackageSpec::new("flask", ">=2,<3").requirement(), "flask>=2,<3");
        assert_eq!(PackageSpec::resolved("redis", "5.0.1").requirement(), "redis==5.0.1");
    }

    #[test]
    fn test_resolve_marks_satisfied_packages() {
        let installed = BTreeMap::from([("flask".to_string(), "2.3.2".to_string())]);
        let resolved = manager()
            .resolve(
                "env-1",
                &installed,
                &[PackageSpec::new("flask", ">=2"), PackageSpec::new("redis", "==5.0")],
            )
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].resolved_version.as_deref(), Some("2.3.2"));
        assert_eq!(resolved[1].resolved_version, None);
    }

    #[test]
    fn test_resolve_aggregates_every_conflict() {
        let installed = BTreeMap::from([
            ("flask".to_string(), "1.1".to_string()),
            ("redis".to_string(), "4.0".to_string()),
        ]);
        let err = manager()
            .resolve(
                "env-1",
                &installed,
                &[
                    PackageSpec::new("flask", ">=2"),
                    PackageSpec::new("requests", "*"),
                    PackageSpec::new("redis", "==5.0"),
                ],
            )
            .unwrap_err();
        match err {
            IsolationError::Conflict { env_id, conflicts } => {
                assert_eq!(env_id.0.as_deref(), Some("env-1"));
                let names: Vec<_> = conflicts.iter().map(|c| c.name.as_str()).collect();
                assert_eq!(names, vec!["flask", "redis"]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_resolve_rejects_contradicting_requests() {
        let err = manager()
            .resolve(
                "env-1",
                &BTreeMap::new(),
                &[PackageSpec::new("flask", "==1.0"), PackageSpec::new("flask", "==2.0")],
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_resolve_rejects_bad_constraint() {
        let err = manager()
            .resolve("env-1", &BTreeMap::new(), &[PackageSpec::new("flask", ">=oops")])
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.env_id(), Some("env-1"));
    }

    #[tokio::test]
    async fn test_install_only_pending() {
        let pm = manager();
        let installed = BTreeMap::from([("flask".to_string(), "2.3.2".to_string())]);
        let resolved = pm
            .resolve(
                "env-1",
                &installed,
                &[PackageSpec::new("flask", "*"), PackageSpec::new("redis", "==5.0.1")],
            )
            .unwrap();
        let report = pm
            .install(
                &InstallTarget::host("env-1", "/tmp"),
                &resolved,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(
            report.results[0].resolved().unwrap(),
            PackageSpec {
                name: "redis".into(),
                version_constraint: "==5.0.1".into(),
                resolved_version: Some("5.0.1".into()),
            }
        );
    }

    #[test]
    fn test_manifest_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PackageManifest::load(dir.path()).unwrap(), PackageManifest::default());
        let manifest = PackageManifest {
            packages: BTreeMap::from([("flask".to_string(), "2.3.2".to_string())]),
        };
        manifest.save(dir.path()).unwrap();
        assert_eq!(PackageManifest::load(dir.path()).unwrap(), manifest);
    }
}
