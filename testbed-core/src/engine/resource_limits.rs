//! Resource limit specification, parsing, and enforcement helpers.
//!
//! Callers express limits declaratively (`memory = "256m"`, `cpu = 1.5`,
//! `disk = "2g"`).  Before any engine call the spec is resolved into numeric
//! [`ResolvedLimits`]; engines with hard enforcement turn them into a
//! [`ResourceLimitBatch`] of runtime flags, and the resource monitor compares
//! sampled [`ResourceUsage`] against them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EnvLabel, IsolationError, Result};

/// Declarative per-environment limits.  Absent fields mean "unbounded".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitSpec {
    /// Memory ceiling, e.g. `"256m"`, `"2g"`, `"1048576"`.
    pub memory: Option<String>,
    /// CPU ceiling in (fractional) cores.
    pub cpu: Option<f64>,
    /// Disk ceiling for the environment directory, same syntax as `memory`.
    pub disk: Option<String>,
}

impl ResourceLimitSpec {
    pub fn memory(value: impl Into<String>) -> Self {
        Self {
            memory: Some(value.into()),
            ..Self::default()
        }
    }

    /// `true` when no limit at all is requested.
    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpu.is_none() && self.disk.is_none()
    }

    /// `true` when memory or cpu is requested; these need hard enforcement.
    pub fn requires_enforcement(&self) -> bool {
        self.memory.is_some() || self.cpu.is_some()
    }

    /// Fill unset fields from `defaults`.
    pub fn merged_with(&self, defaults: &ResourceLimitSpec) -> ResourceLimitSpec {
        ResourceLimitSpec {
            memory: self.memory.clone().or_else(|| defaults.memory.clone()),
            cpu: self.cpu.or(defaults.cpu),
            disk: self.disk.clone().or_else(|| defaults.disk.clone()),
        }
    }

    /// Parse every field, failing on the first malformed one.
    pub fn resolve(&self, env_id: Option<&str>) -> Result<ResolvedLimits> {
        let label = EnvLabel::from(env_id);
        let memory_bytes = match &self.memory {
            Some(raw) => Some(parse_size(raw).map_err(|msg| {
                IsolationError::validation(label.clone(), "parse_memory_limit", msg)
            })?),
            None => None,
        };
        let disk_bytes = match &self.disk {
            Some(raw) => Some(parse_size(raw).map_err(|msg| {
                IsolationError::validation(label.clone(), "parse_disk_limit", msg)
            })?),
            None => None,
        };
        if let Some(cpu) = self.cpu {
            if !cpu.is_finite() || cpu <= 0.0 {
                return Err(IsolationError::validation(
                    label,
                    "parse_cpu_limit",
                    format!("cpu limit must be a positive number of cores, got {cpu}"),
                ));
            }
        }
        Ok(ResolvedLimits {
            memory_bytes,
            cpu_cores: self.cpu,
            disk_bytes,
        })
    }
}

/// Parse a docker-style size: a plain byte count or a number followed by
/// `b`, `k`, `m`, `g`, or `t` (binary multiples, case-insensitive, optional
/// trailing `b`/`ib`).
pub fn parse_size(raw: &str) -> std::result::Result<u64, String> {
    let bytes = parse_bytes(raw)?;
    if bytes == 0 {
        return Err(format!("size '{raw}' must be at least one byte"));
    }
    Ok(bytes)
}

/// Like [`parse_size`] but accepts zero, for reading usage figures such as
/// `0B` or `12.5MiB` reported by a runtime.
pub fn parse_bytes(raw: &str) -> std::result::Result<u64, String> {
    let text = raw.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Err("size must not be empty".to_string());
    }
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid size '{raw}'"))?;
    let multiplier: u64 = match unit.trim_end_matches("ib").trim_end_matches('b') {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => return Err(format!("unknown size unit in '{raw}'")),
    };
    Ok((value * multiplier as f64).round() as u64)
}

/// Numeric limits after parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub disk_bytes: Option<u64>,
}

impl ResolvedLimits {
    pub fn is_unbounded(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu_cores.is_none() && self.disk_bytes.is_none()
    }

    /// Build the batch of hard limits a container runtime should apply.
    pub fn to_batch(&self, soft_ratio: f64) -> ResourceLimitBatch {
        let mut batch = ResourceLimitBatch::new();
        if let Some(memory) = self.memory_bytes {
            batch.add_limit(ResourceKind::MemoryMax, memory);
            batch.add_limit(ResourceKind::MemoryHigh, (memory as f64 * soft_ratio) as u64);
        }
        if let Some(cpu) = self.cpu_cores {
            batch.add_limit(ResourceKind::CpuMillis, (cpu * 1000.0).round() as u64);
        }
        if let Some(disk) = self.disk_bytes {
            batch.add_limit(ResourceKind::DiskMax, disk);
        }
        batch
    }

    /// Compare a usage sample against these limits.
    ///
    /// A resource at or above its limit is a hard breach; at or above
    /// `soft_ratio * limit` it is a soft breach.
    pub fn evaluate(&self, usage: &ResourceUsage, soft_ratio: f64) -> LimitStatus {
        let mut hard = Vec::new();
        let mut soft = Vec::new();

        let mut check = |kind: ResourceKind, used: Option<f64>, limit: Option<f64>| {
            if let (Some(used), Some(limit)) = (used, limit) {
                if used >= limit {
                    hard.push(kind);
                } else if used >= limit * soft_ratio {
                    soft.push(kind);
                }
            }
        };
        check(
            ResourceKind::MemoryMax,
            usage.memory_bytes.map(|v| v as f64),
            self.memory_bytes.map(|v| v as f64),
        );
        check(ResourceKind::CpuMillis, usage.cpu_cores, self.cpu_cores);
        check(
            ResourceKind::DiskMax,
            usage.disk_bytes.map(|v| v as f64),
            self.disk_bytes.map(|v| v as f64),
        );

        if !hard.is_empty() {
            LimitStatus::Hard(hard)
        } else if !soft.is_empty() {
            LimitStatus::Soft(soft)
        } else {
            LimitStatus::Within
        }
    }
}

/// Point-in-time usage reported by an engine's accounting mechanism.
/// `None` means the engine could not measure that resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub disk_bytes: Option<u64>,
}

/// Outcome of [`ResolvedLimits::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitStatus {
    Within,
    Soft(Vec<ResourceKind>),
    Hard(Vec<ResourceKind>),
}

/// Identifies a single enforceable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Hard memory ceiling in bytes.
    MemoryMax,
    /// Memory reservation / soft watermark in bytes.
    MemoryHigh,
    /// CPU ceiling in millicores.
    CpuMillis,
    /// Disk ceiling in bytes (monitor-enforced).
    DiskMax,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryMax => write!(f, "memory"),
            Self::MemoryHigh => write!(f, "memory-reservation"),
            Self::CpuMillis => write!(f, "cpu"),
            Self::DiskMax => write!(f, "disk"),
        }
    }
}

/// Collects limit changes and renders them as container runtime flags in
/// one pass.  Multiple entries for the same kind are allowed; the last one
/// wins.
#[derive(Debug, Default)]
pub struct ResourceLimitBatch {
    entries: Vec<(ResourceKind, u64)>,
}

impl ResourceLimitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_limit(&mut self, kind: ResourceKind, value: u64) {
        debug!(resource = %kind, value, "Queuing resource limit");
        self.entries.push((kind, value));
    }

    /// Effective limits after last-writer-wins deduplication.
    pub fn effective(&self) -> HashMap<ResourceKind, u64> {
        let mut deduped = HashMap::new();
        for (kind, value) in &self.entries {
            deduped.insert(*kind, *value);
        }
        deduped
    }

    /// Render as `docker create`-style flags, in a stable order.
    /// Disk is enforced by the resource monitor and produces no flag.
    pub fn to_runtime_args(&self) -> Vec<String> {
        let effective = self.effective();
        let mut args = Vec::new();
        if let Some(memory) = effective.get(&ResourceKind::MemoryMax) {
            args.push(format!("--memory={memory}b"));
        }
        if let Some(high) = effective.get(&ResourceKind::MemoryHigh) {
            args.push(format!("--memory-reservation={high}b"));
        }
        if let Some(millis) = effective.get(&ResourceKind::CpuMillis) {
            args.push(format!("--cpus={:.3}", *millis as f64 / 1000.0));
        }
        args
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("256m").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_size("256MB").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5k").unwrap(), 1536);
        assert_eq!(parse_size("4GiB").unwrap(), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("10x").is_err());
        assert!(parse_size("0").is_err());
    }

    #[test]
    fn test_parse_bytes_accepts_runtime_figures() {
        assert_eq!(parse_bytes("0B").unwrap(), 0);
        assert_eq!(parse_bytes("12.5MiB").unwrap(), 13_107_200);
        assert_eq!(parse_bytes("1.5kB").unwrap(), 1536);
    }

    #[test]
    fn test_resolve_reports_step() {
        let spec = ResourceLimitSpec::memory("lots");
        let err = spec.resolve(Some("env-1")).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.step(), "parse_memory_limit");

        let spec = ResourceLimitSpec {
            cpu: Some(-1.0),
            ..Default::default()
        };
        assert_eq!(spec.resolve(None).unwrap_err().step(), "parse_cpu_limit");
    }

    #[test]
    fn test_merged_with_defaults() {
        let defaults = ResourceLimitSpec {
            memory: Some("1g".into()),
            cpu: Some(2.0),
            disk: None,
        };
        let merged = ResourceLimitSpec::memory("256m").merged_with(&defaults);
        assert_eq!(merged.memory.as_deref(), Some("256m"));
        assert_eq!(merged.cpu, Some(2.0));
        assert!(merged.disk.is_none());
    }

    #[test]
    fn test_batch_deduplicates_last_wins() {
        let mut batch = ResourceLimitBatch::new();
        batch.add_limit(ResourceKind::MemoryMax, 100);
        batch.add_limit(ResourceKind::MemoryMax, 200);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.effective()[&ResourceKind::MemoryMax], 200);
    }

    #[test]
    fn test_runtime_args() {
        let limits = ResourceLimitSpec {
            memory: Some("256m".into()),
            cpu: Some(1.5),
            disk: Some("1g".into()),
        }
        .resolve(None)
        .unwrap();
        let args = limits.to_batch(0.5).to_runtime_args();
        assert_eq!(
            args,
            vec![
                format!("--memory={}b", 256 * 1024 * 1024),
                format!("--memory-reservation={}b", 128 * 1024 * 1024),
                "--cpus=1.500".to_string(),
            ]
        );
    }

    #[test]
    fn test_evaluate_soft_and_hard() {
        let limits = ResolvedLimits {
            memory_bytes: Some(1000),
            cpu_cores: Some(1.0),
            disk_bytes: None,
        };
        let within = ResourceUsage {
            memory_bytes: Some(100),
            cpu_cores: Some(0.1),
            disk_bytes: Some(10_000),
        };
        assert_eq!(limits.evaluate(&within, 0.8), LimitStatus::Within);

        let soft = ResourceUsage {
            memory_bytes: Some(850),
            ..within
        };
        assert_eq!(
            limits.evaluate(&soft, 0.8),
            LimitStatus::Soft(vec![ResourceKind::MemoryMax])
        );

        let hard = ResourceUsage {
            memory_bytes: Some(850),
            cpu_cores: Some(1.2),
            disk_bytes: None,
        };
        assert_eq!(
            limits.evaluate(&hard, 0.8),
            LimitStatus::Hard(vec![ResourceKind::CpuMillis])
        );
    }

    #[test]
    fn test_resource_kind_display() {
        assert_eq!(ResourceKind::MemoryMax.to_string(), "memory");
        assert_eq!(ResourceKind::CpuMillis.to_string(), "cpu");
        assert_eq!(ResourceKind::DiskMax.to_string(), "disk");
    }
}
