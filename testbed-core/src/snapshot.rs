//! Declarative environment snapshots.
//!
//! A snapshot records what an environment *is* (its engine, request and
//! resolved packages, plus the image digest for containers), never what is
//! on disk.  Restoring always builds a fresh environment through the
//! manager and replays the package set pinned to the captured versions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::environment::{EnvironmentRequest, EnvironmentSummary, IsolationKind};
use crate::error::{IsolationError, Result};
use crate::manager::IsolationManager;
use crate::package::PackageSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub source_env_id: String,
    pub isolation_kind: IsolationKind,
    pub config: EnvironmentRequest,
    /// Package name to installed version.
    pub resolved_package_set: BTreeMap<String, String>,
    /// Image digest the source container ran, if any.
    pub image_ref: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl SnapshotRecord {
    /// The creation request that rebuilds this snapshot: the captured config
    /// with every package pinned to its captured version.
    pub fn restore_request(&self) -> EnvironmentRequest {
        let mut request = self.config.clone();
        request.isolation_kind = Some(self.isolation_kind);
        request.packages = self
            .resolved_package_set
            .iter()
            .map(|(name, version)| PackageSpec::new(name, format!("=={version}")))
            .collect();
        if let Some(image) = &self.image_ref {
            request.image = Some(image.clone());
        }
        request
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write snapshot {}", path.display()))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("{} is not a snapshot record", path.display()))
    }
}

/// Captured records, by snapshot id.
#[derive(Default)]
pub struct SnapshotManager {
    records: Mutex<BTreeMap<String, SnapshotRecord>>,
    next_id: AtomicU64,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn capture(&self, manager: &IsolationManager, env_id: &str) -> Result<SnapshotRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = manager
            .with_environment(env_id, |env, engine| {
                Ok(SnapshotRecord {
                    snapshot_id: format!("snap-{id:06}"),
                    source_env_id: env.env_id.clone(),
                    isolation_kind: env.isolation_kind,
                    config: env.config.clone(),
                    resolved_package_set: env.packages.clone(),
                    image_ref: engine.image_reference(env),
                    captured_at: Utc::now(),
                })
            })
            .await?;

        info!(
            env_id,
            snapshot_id = %record.snapshot_id,
            packages = record.resolved_package_set.len(),
            "Captured snapshot"
        );
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.snapshot_id.clone(), record.clone());
        Ok(record)
    }

    /// Build a new environment at `new_path` from `record`.
    ///
    /// Fails, and tears the new environment down, if the installed set does
    /// not come out equal to the captured one.
    pub async fn restore(
        &self,
        manager: &IsolationManager,
        record: &SnapshotRecord,
        new_path: impl Into<PathBuf>,
    ) -> Result<EnvironmentSummary> {
        let restored = manager
            .create_as(new_path.into(), record.restore_request(), Some(record.isolation_kind))
            .await?;

        if restored.packages != record.resolved_package_set {
            warn!(
                env_id = %restored.env_id,
                snapshot_id = %record.snapshot_id,
                expected = ?record.resolved_package_set,
                actual = ?restored.packages,
                "Restored package set diverged from snapshot"
            );
            if let Err(e) = manager.destroy_environment(&restored.env_id, true).await {
                warn!(env_id = %restored.env_id, error = %e, "Teardown of diverged restore left residue");
            }
            return Err(IsolationError::engine(
                &restored.env_id,
                "verify_packages",
                anyhow::anyhow!(
                    "restored packages differ from snapshot {}",
                    record.snapshot_id
                ),
            ));
        }

        info!(
            env_id = %restored.env_id,
            snapshot_id = %record.snapshot_id,
            source = %record.source_env_id,
            "Restored snapshot"
        );
        Ok(restored)
    }

    pub fn get(&self, snapshot_id: &str) -> Option<SnapshotRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(snapshot_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<SnapshotRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn remove(&self, snapshot_id: &str) -> Option<SnapshotRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(snapshot_id)
    }
}

impl IsolationManager {
    /// Capture `env_id` into this manager's snapshot store.
    pub async fn capture_snapshot(&self, env_id: &str) -> Result<SnapshotRecord> {
        self.snapshots().capture(self, env_id).await
    }

    pub async fn restore_snapshot(
        &self,
        record: &SnapshotRecord,
        new_path: impl Into<PathBuf>,
    ) -> Result<EnvironmentSummary> {
        self.snapshots().restore(self, record, new_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::package::installer::{InstallTarget, PackageInstaller};
    use crate::ports::PortRange;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Installs the pinned version, or `drift` for unpinned requests.
    struct PinInstaller {
        drift: &'static str,
    }

    #[async_trait]
    impl PackageInstaller for PinInstaller {
        async fn install(&self, _target: &InstallTarget, package: &PackageSpec) -> Result<String> {
            Ok(package
                .constraint()?
                .exact()
                .map(|v| v.to_string())
                .unwrap_or_else(|| self.drift.to_string()))
        }
    }

    fn manager(drift: &'static str) -> IsolationManager {
        IsolationManager::builder(ManagerConfig {
            port_range: PortRange::new(42000, 42009),
            ..ManagerConfig::default()
        })
        .without_port_probe()
        .installer(Arc::new(PinInstaller { drift }))
        .build()
        .unwrap()
    }

    #[test]
    fn test_restore_request_pins_packages() {
        let record = SnapshotRecord {
            snapshot_id: "snap-000001".into(),
            source_env_id: "env-000001".into(),
            isolation_kind: IsolationKind::Container,
            config: EnvironmentRequest::new()
                .with_packages(vec![PackageSpec::new("flask", ">=2")]),
            resolved_package_set: BTreeMap::from([("flask".to_string(), "2.3.2".to_string())]),
            image_ref: Some("sha256:abc".into()),
            captured_at: Utc::now(),
        };
        let request = record.restore_request();
        assert_eq!(request.isolation_kind, Some(IsolationKind::Container));
        assert_eq!(request.packages, vec![PackageSpec::new("flask", "==2.3.2")]);
        assert_eq!(request.image.as_deref(), Some("sha256:abc"));
    }

    #[tokio::test]
    async fn test_capture_and_restore_after_source_is_gone() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager("4.1");
        let source = mgr
            .create_environment(
                root.path().join("src"),
                EnvironmentRequest::new()
                    .with_kind(IsolationKind::ProcessVenv)
                    .with_packages(vec![PackageSpec::new("redis", "*")]),
            )
            .await
            .unwrap();

        let record = mgr.capture_snapshot(&source.env_id).await.unwrap();
        assert_eq!(record.resolved_package_set.get("redis").map(String::as_str), Some("4.1"));
        assert_eq!(record.image_ref, None);
        assert!(mgr.destroy_environment(&source.env_id, false).await.unwrap());

        let restored = mgr
            .restore_snapshot(&record, root.path().join("copy"))
            .await
            .unwrap();
        assert_ne!(restored.env_id, source.env_id);
        assert_eq!(restored.isolation_kind, IsolationKind::ProcessVenv);
        assert_eq!(restored.packages, record.resolved_package_set);
    }

    #[tokio::test]
    async fn test_store_and_persistence() {
        let root = tempfile::tempdir().unwrap();
        let mgr = manager("1.0");
        let env = mgr
            .create_environment(root.path().join("a"), EnvironmentRequest::new())
            .await
            .unwrap();
        let record = mgr.capture_snapshot(&env.env_id).await.unwrap();
        assert_eq!(mgr.snapshots().get(&record.snapshot_id), Some(record.clone()));
        assert_eq!(mgr.snapshots().list().len(), 1);

        let file = root.path().join("snap.json");
        record.save(&file).unwrap();
        assert_eq!(SnapshotRecord::load(&file).unwrap(), record);
        assert!(SnapshotRecord::load(root.path().join("missing.json")).is_err());

        assert!(mgr.snapshots().remove(&record.snapshot_id).is_some());
        assert!(mgr.snapshots().list().is_empty());
    }

    #[tokio::test]
    async fn test_capture_unknown_environment() {
        let mgr = manager("1.0");
        let err = mgr.capture_snapshot("env-404").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.env_id(), Some("env-404"));
    }
}
