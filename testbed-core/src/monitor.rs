//! Resource Monitor - Per-Environment Limit Enforcement
//!
//! One sampling loop runs per ACTIVE environment whose engine supports
//! limits.  Each tick reads usage through the engine's own accounting and
//! compares it with the environment's resolved limits.
//!
//! # Design:
//! - Soft breach publishes `resource_warning` once per excursion above the
//!   soft watermark
//! - Hard breach publishes `resource_violation`, hands the environment to
//!   the violation handler (which deactivates it), and ends the loop
//! - The loop is tied to a child of the environment's cancellation token and
//!   runs on the environment's task tracker, so teardown can wait for it

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::engine::resource_limits::{LimitStatus, ResolvedLimits, ResourceKind};
use crate::engine::{IsolationEngine, UsageProbe};
use crate::events::{EventBus, EventRecord, Transition};

/// Called with the environment id and the breached resources.
pub type ViolationHandler = Arc<dyn Fn(&str, &[ResourceKind]) + Send + Sync>;

/// A running sampling loop.
pub struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the loop and wait for it to observe the cancellation.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[derive(Clone)]
pub struct ResourceMonitor {
    interval: Duration,
    soft_ratio: f64,
    events: Arc<EventBus>,
}

impl ResourceMonitor {
    pub fn new(interval: Duration, soft_ratio: f64, events: Arc<EventBus>) -> Self {
        Self {
            interval,
            soft_ratio,
            events,
        }
    }

    /// Start sampling `probe`.  Returns `None` when the engine cannot
    /// enforce limits or there is nothing to enforce.
    pub fn start(
        &self,
        engine: Arc<dyn IsolationEngine>,
        probe: UsageProbe,
        limits: ResolvedLimits,
        parent: &CancellationToken,
        tracker: &TaskTracker,
        on_violation: ViolationHandler,
    ) -> Option<MonitorHandle> {
        if !engine.capabilities().supports_resource_limits || limits.is_unbounded() {
            return None;
        }
        let token = parent.child_token();
        let task = tracker.spawn(sample_loop(
            self.clone(),
            engine,
            probe,
            limits,
            token.clone(),
            on_violation,
        ));
        Some(MonitorHandle { token, task })
    }
}

async fn sample_loop(
    monitor: ResourceMonitor,
    engine: Arc<dyn IsolationEngine>,
    probe: UsageProbe,
    limits: ResolvedLimits,
    token: CancellationToken,
    on_violation: ViolationHandler,
) {
    let mut ticker = tokio::time::interval(monitor.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut warned = false;
    debug!(env_id = %probe.env_id, interval_ms = monitor.interval.as_millis() as u64, "Resource monitor started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sample = tokio::select! {
            _ = token.cancelled() => break,
            sample = engine.sample_usage(&probe) => sample,
        };
        let usage = match sample {
            Ok(usage) => usage,
            Err(e) => {
                debug!(env_id = %probe.env_id, error = %e, "Usage sample failed");
                continue;
            }
        };

        match limits.evaluate(&usage, monitor.soft_ratio) {
            LimitStatus::Within => warned = false,
            LimitStatus::Soft(kinds) => {
                if warned {
                    continue;
                }
                warned = true;
                warn!(env_id = %probe.env_id, resources = ?kinds, "Soft resource limit reached");
                monitor.events.publish(
                    &EventRecord::new(&probe.env_id, Transition::ResourceWarning)
                        .with_payload(json!({ "resources": names(&kinds), "usage": usage })),
                );
            }
            LimitStatus::Hard(kinds) => {
                warn!(env_id = %probe.env_id, resources = ?kinds, "Hard resource limit breached");
                monitor.events.publish(
                    &EventRecord::new(&probe.env_id, Transition::ResourceViolation)
                        .with_payload(json!({ "resources": names(&kinds), "usage": usage })),
                );
                on_violation(&probe.env_id, &kinds);
                break;
            }
        }
    }
    info!(env_id = %probe.env_id, "Resource monitor stopped");
}

fn names(kinds: &[ResourceKind]) -> Vec<String> {
    kinds.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::resource_limits::ResourceUsage;
    use crate::engine::{CreateSpec, EngineCapability, ValidationResult};
    use crate::environment::{Environment, IsolationKind};
    use crate::error::Result;
    use crate::process::CommandSpec;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted samples; repeats the last one forever.
    struct ScriptedEngine {
        samples: Mutex<VecDeque<ResourceUsage>>,
        limits: bool,
    }

    impl ScriptedEngine {
        fn new(samples: Vec<u64>, limits: bool) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(
                    samples
                        .into_iter()
                        .map(|m| ResourceUsage {
                            memory_bytes: Some(m),
                            ..Default::default()
                        })
                        .collect(),
                ),
                limits,
            })
        }
    }

    #[async_trait]
    impl IsolationEngine for ScriptedEngine {
        fn kind(&self) -> IsolationKind {
            IsolationKind::ProcessVenv
        }

        fn capabilities(&self) -> EngineCapability {
            EngineCapability {
                supports_resource_limits: self.limits,
                supports_networking: false,
                supports_private_network: false,
                relative_cost_weight: 1,
            }
        }

        async fn create(&self, spec: &CreateSpec) -> Result<Environment> {
            Ok(spec.new_environment(self.kind()))
        }

        async fn activate(&self, _env: &mut Environment) -> Result<bool> {
            Ok(true)
        }

        async fn deactivate(&self, _env: &mut Environment) -> Result<bool> {
            Ok(true)
        }

        async fn cleanup(&self, _env: &mut Environment, _force: bool) -> Result<bool> {
            Ok(true)
        }

        async fn validate(&self, _env: &Environment) -> ValidationResult {
            ValidationResult::ok()
        }

        fn prepare_command(&self, _env: &Environment, command: &CommandSpec) -> Result<CommandSpec> {
            Ok(command.clone())
        }

        async fn sample_usage(&self, _probe: &UsageProbe) -> Result<ResourceUsage> {
            let mut samples = self.samples.lock().unwrap();
            let next = if samples.len() > 1 {
                samples.pop_front()
            } else {
                samples.front().copied()
            };
            Ok(next.unwrap_or_default())
        }
    }

    fn probe() -> UsageProbe {
        UsageProbe {
            env_id: "env-7".into(),
            path: "/nonexistent".into(),
            container_id: None,
        }
    }

    fn limits() -> ResolvedLimits {
        ResolvedLimits {
            memory_bytes: Some(100),
            ..Default::default()
        }
    }

    fn count(bus: &EventBus, transition: Transition) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe(transition, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        counter
    }

    #[tokio::test]
    async fn test_no_loop_without_limit_support() {
        let bus = Arc::new(EventBus::new());
        let monitor = ResourceMonitor::new(Duration::from_millis(5), 0.8, bus);
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let noop: ViolationHandler = Arc::new(|_: &str, _: &[ResourceKind]| {});

        let unsupported = ScriptedEngine::new(vec![500], false);
        assert!(monitor
            .start(unsupported, probe(), limits(), &token, &tracker, Arc::clone(&noop))
            .is_none());

        let supported = ScriptedEngine::new(vec![500], true);
        assert!(monitor
            .start(supported, probe(), ResolvedLimits::default(), &token, &tracker, noop)
            .is_none());
    }

    #[tokio::test]
    async fn test_soft_warning_once_per_excursion() {
        let bus = Arc::new(EventBus::new());
        let warnings = count(&bus, Transition::ResourceWarning);
        let monitor = ResourceMonitor::new(Duration::from_millis(5), 0.8, Arc::clone(&bus));
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        // soft, soft, within, soft, then within forever
        let engine = ScriptedEngine::new(vec![85, 90, 10, 95, 10], true);
        let handle = monitor
            .start(engine, probe(), limits(), &token, &tracker, Arc::new(|_: &str, _: &[ResourceKind]| {}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;
        assert_eq!(warnings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hard_breach_triggers_violation_and_ends_loop() {
        let bus = Arc::new(EventBus::new());
        let violations = count(&bus, Transition::ResourceViolation);
        let monitor = ResourceMonitor::new(Duration::from_millis(5), 0.8, Arc::clone(&bus));
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        let handled = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&handled);
        let engine = ScriptedEngine::new(vec![10, 150], true);
        let handle = monitor
            .start(
                engine,
                probe(),
                limits(),
                &token,
                &tracker,
                Arc::new(move |env_id: &str, kinds: &[ResourceKind]| {
                    sink.lock().unwrap().push((env_id.to_string(), kinds.to_vec()));
                }),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(violations.load(Ordering::SeqCst), 1);
        assert_eq!(
            *handled.lock().unwrap(),
            vec![("env-7".to_string(), vec![ResourceKind::MemoryMax])]
        );
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_loop() {
        let bus = Arc::new(EventBus::new());
        let monitor = ResourceMonitor::new(Duration::from_millis(5), 0.8, bus);
        let tracker = TaskTracker::new();
        let parent = CancellationToken::new();
        monitor
            .start(
                ScriptedEngine::new(vec![10], true),
                probe(),
                limits(),
                &parent,
                &tracker,
                Arc::new(|_: &str, _: &[ResourceKind]| {}),
            )
            .unwrap();

        parent.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
    }
}
