//! Conflict-free host port allocation.
//!
//! The pool is a single mutex-guarded structure; `allocate` does its whole
//! test-and-set inside that critical section, so two concurrent callers can
//! never receive overlapping ports.  Each candidate is also bind-probed to
//! skip ports something outside the pool already holds.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IsolationError, Result};

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(20000, 20999)
    }
}

#[derive(Debug, Default)]
struct PortPool {
    free: BTreeSet<u16>,
    /// port -> owning environment
    allocated: BTreeMap<u16, String>,
    /// port -> environment that was force-removed while still holding it
    quarantined: BTreeMap<u16, String>,
}

#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    probe: bool,
    pool: Mutex<PortPool>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        let pool = PortPool {
            free: (range.start..=range.end).collect(),
            ..PortPool::default()
        };
        Self {
            range,
            probe: true,
            pool: Mutex::new(pool),
        }
    }

    /// Disable the bind probe; the pool's own bookkeeping still applies.
    pub fn without_probe(mut self) -> Self {
        self.probe = false;
        self
    }

    /// Atomically reserve `count` ports for `owner`.
    ///
    /// Either all `count` ports are assigned or none are.  Ports that fail
    /// the bind probe stay in the free pool and are simply skipped.
    pub fn allocate(&self, owner: &str, count: usize) -> Result<Vec<u16>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);

        let mut chosen = Vec::with_capacity(count);
        let mut skipped = 0usize;
        for &port in pool.free.iter() {
            if chosen.len() == count {
                break;
            }
            if self.probe && !port_is_bindable(port) {
                skipped += 1;
                debug!(port, "Port occupied outside the pool, skipping");
                continue;
            }
            chosen.push(port);
        }

        if chosen.len() < count {
            return Err(IsolationError::allocation(
                owner,
                "allocate_ports",
                format!(
                    "requested {count} port(s) from {}-{}, only {} available ({} free in pool, {} externally occupied)",
                    self.range.start,
                    self.range.end,
                    chosen.len(),
                    pool.free.len(),
                    skipped
                ),
            ));
        }

        for port in &chosen {
            pool.free.remove(port);
            pool.allocated.insert(*port, owner.to_string());
        }
        debug!(owner, ports = ?chosen, "Allocated ports");
        Ok(chosen)
    }

    /// Return ports to the pool.  Callers must only do this once the
    /// owning process or container has fully terminated.
    pub fn release(&self, ports: &[u16]) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports {
            if pool.allocated.remove(port).is_some() {
                pool.free.insert(*port);
            } else {
                warn!(port, "Released a port that was not allocated");
            }
        }
        debug!(ports = ?ports, "Released ports");
    }

    /// Hold ports out of circulation because their owner could not be
    /// confirmed terminated.
    pub fn quarantine(&self, ports: &[u16]) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports {
            if let Some(owner) = pool.allocated.remove(port) {
                pool.quarantined.insert(*port, owner);
            }
        }
        warn!(ports = ?ports, "Quarantined ports with unconfirmed owner termination");
    }

    pub fn quarantined(&self) -> Vec<u16> {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.quarantined.keys().copied().collect()
    }

    pub fn available(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .len()
    }

    pub fn allocated(&self) -> BTreeMap<u16, String> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocated
            .clone()
    }

    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocated
            .get(&port)
            .cloned()
    }
}

fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
