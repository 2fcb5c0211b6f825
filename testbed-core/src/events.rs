//! Publish/subscribe lifecycle hooks.
//!
//! Subscribers register an explicit handler per transition (or for every
//! transition).  A handler that returns an error or panics is recorded as a
//! fault against its subscription; delivery to the remaining subscribers and
//! the lifecycle operation that published the event both continue.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::environment::EnvironmentState;

/// Most recent subscriber faults kept; older ones are dropped.
pub const MAX_RETAINED_FAULTS: usize = 256;

/// Lifecycle transitions and monitor signals that can be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Creating,
    Ready,
    Active,
    Stopping,
    Failed,
    Destroying,
    Destroyed,
    ResourceWarning,
    ResourceViolation,
    PackagesInstalled,
}

impl Transition {
    /// The event emitted when an environment enters `state`.
    pub fn entering(state: EnvironmentState) -> Option<Transition> {
        match state {
            EnvironmentState::Uninitialized => None,
            EnvironmentState::Creating => Some(Self::Creating),
            EnvironmentState::Ready => Some(Self::Ready),
            EnvironmentState::Active => Some(Self::Active),
            EnvironmentState::Stopping => Some(Self::Stopping),
            EnvironmentState::Failed => Some(Self::Failed),
            EnvironmentState::Destroying => Some(Self::Destroying),
            EnvironmentState::Destroyed => Some(Self::Destroyed),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::ResourceWarning => "resource_warning",
            Self::ResourceViolation => "resource_violation",
            Self::PackagesInstalled => "packages_installed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub environment_id: String,
    pub transition: Transition,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventRecord {
    pub fn new(environment_id: impl Into<String>, transition: Transition) -> Self {
        Self {
            environment_id: environment_id.into(),
            transition,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

pub type EventHandler = Arc<dyn Fn(&EventRecord) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A handler failure captured during delivery.
#[derive(Debug, Clone)]
pub struct SubscriberFault {
    pub subscription: SubscriptionId,
    pub transition: Transition,
    pub environment_id: String,
    pub message: String,
}

struct Subscription {
    id: SubscriptionId,
    filter: Option<Transition>,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    faults: Mutex<VecDeque<SubscriberFault>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one transition.
    pub fn subscribe<F>(&self, transition: Transition, handler: F) -> SubscriptionId
    where
        F: Fn(&EventRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(Some(transition), Arc::new(handler))
    }

    /// Register `handler` for every transition.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&EventRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    fn insert(&self, filter: Option<Transition>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                filter,
                handler,
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver `record` to matching subscribers in subscription order.
    /// Returns the number of handlers that completed without fault.
    pub fn publish(&self, record: &EventRecord) -> usize {
        // Handlers run outside the lock so they may subscribe or publish.
        let targets: Vec<(SubscriptionId, EventHandler)> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.filter.map_or(true, |t| t == record.transition))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        debug!(
            env_id = %record.environment_id,
            transition = %record.transition,
            subscribers = targets.len(),
            "Publishing event"
        );

        let mut delivered = 0;
        for (id, handler) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(record)));
            let message = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(
                env_id = %record.environment_id,
                transition = %record.transition,
                subscription = id.0,
                error = %message,
                "Event subscriber failed"
            );
            let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            if faults.len() == MAX_RETAINED_FAULTS {
                faults.pop_front();
            }
            faults.push_back(SubscriberFault {
                subscription: id,
                transition: record.transition,
                environment_id: record.environment_id.clone(),
                message,
            });
        }
        delivered
    }

    /// Recorded faults, oldest first, capped at [`MAX_RETAINED_FAULTS`].
    pub fn faults(&self) -> Vec<SubscriberFault> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, log: &Arc<Mutex<Vec<String>>>, tag: &'static str) {
        let log = Arc::clone(log);
        bus.subscribe(Transition::Ready, move |_| {
            log.lock().unwrap().push(tag.to_string());
            Ok(())
        });
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, &log, "first");
        recorder(&bus, &log, "second");
        recorder(&bus, &log, "third");

        let delivered = bus.publish(&EventRecord::new("env-1", Transition::Ready));
        assert_eq!(delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_filter_by_transition() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, &log, "ready");
        assert_eq!(bus.publish(&EventRecord::new("env-1", Transition::Active)), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Transition::Ready, |_| anyhow::bail!("handler broke"));
        bus.subscribe(Transition::Ready, |_| panic!("handler exploded"));
        recorder(&bus, &log, "survivor");

        let delivered = bus.publish(&EventRecord::new("env-9", Transition::Ready));
        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);

        let faults = bus.faults();
        assert_eq!(faults.len(), 2);
        assert!(faults[0].message.contains("handler broke"));
        assert!(faults[1].message.contains("handler exploded"));
        assert!(faults.iter().all(|f| f.environment_id == "env-9"));
    }

    #[test]
    fn test_fault_log_keeps_only_recent_entries() {
        let bus = EventBus::new();
        bus.subscribe_all(|record| anyhow::bail!("rejected {}", record.environment_id));
        for i in 0..MAX_RETAINED_FAULTS + 10 {
            bus.publish(&EventRecord::new(format!("env-{i}"), Transition::Ready));
        }
        let faults = bus.faults();
        assert_eq!(faults.len(), MAX_RETAINED_FAULTS);
        assert_eq!(faults[0].environment_id, "env-10");
        assert_eq!(
            faults[MAX_RETAINED_FAULTS - 1].environment_id,
            format!("env-{}", MAX_RETAINED_FAULTS + 9)
        );
    }

    #[test]
    fn test_subscribe_all_and_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = bus.subscribe_all(move |record| {
            sink.lock().unwrap().push(record.transition);
            Ok(())
        });
        bus.publish(&EventRecord::new("env-1", Transition::Creating));
        bus.publish(&EventRecord::new("env-1", Transition::Ready));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&EventRecord::new("env-1", Transition::Active));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Transition::Creating, Transition::Ready]
        );
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_entering_state_mapping() {
        assert_eq!(Transition::entering(EnvironmentState::Uninitialized), None);
        assert_eq!(
            Transition::entering(EnvironmentState::Stopping),
            Some(Transition::Stopping)
        );
        assert_eq!(Transition::ResourceWarning.to_string(), "resource_warning");
    }
}
