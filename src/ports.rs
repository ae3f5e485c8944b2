//! Port allocation and the process-wide instance registry.
//!
//! Allocation is advisory: [`free_port`] binds and immediately releases a
//! listener, so another process can still grab the port before Tor does.
//! The registry only guarantees that instances in *this* process never
//! receive overlapping port ranges.

use crate::config::PORT_SPAN;
use crate::error::{Result, TorPoolError};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, trace};

/// Find a bindable local port, starting at `hint`.
///
/// A zero hint lets the OS choose. A busy nonzero hint moves on to the next
/// port until one binds or the range runs out.
pub fn free_port(hint: u16) -> Result<u16> {
    let mut candidate = hint;
    loop {
        match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, candidate)) {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                trace!("Port {} is free", port);
                return Ok(port);
            }
            Err(e) if candidate == 0 => return Err(e.into()),
            Err(e) => {
                trace!("Port {} unavailable: {}", candidate, e);
                candidate = candidate.checked_add(1).ok_or_else(|| {
                    TorPoolError::ConfigurationError(format!("No free port at or above {}", hint))
                })?;
            }
        }
    }
}

/// Identifies one [`TorInstance`](crate::TorInstance) in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        InstanceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tor#{}", self.0)
    }
}

/// Ports claimed by each live instance.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Mutex<BTreeMap<InstanceId, Vec<u16>>>,
}

impl InstanceRegistry {
    /// An empty registry, for tests or isolated pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every instance that was not given its own.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<InstanceRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<InstanceId, Vec<u16>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick a socks base port for `id` and claim `base..=base+3`.
    ///
    /// The probe starts at `default_port` for the first instance and at
    /// least [`PORT_SPAN`] above the highest claimed port otherwise. The
    /// lookup and the claim happen under one lock.
    pub fn allocate(&self, id: InstanceId, default_port: u16) -> Result<u16> {
        let mut instances = self.lock();
        let hint = match highest(&instances) {
            Some(top) => top.checked_add(PORT_SPAN).ok_or_else(|| {
                TorPoolError::ConfigurationError(format!("Port space exhausted above {}", top))
            })?,
            None => default_port,
        }
        .max(default_port);

        let base = free_port(hint)?;
        let reserved: Vec<u16> = (0..4).filter_map(|offset| base.checked_add(offset)).collect();
        debug!("{} allocated ports {:?}", id, reserved);
        instances.insert(id, reserved);
        Ok(base)
    }

    /// Record the full set of ports `id` uses, replacing any earlier claim.
    ///
    /// Fails without touching the registry when one of `ports` is already
    /// claimed by another instance.
    pub fn register(&self, id: InstanceId, ports: Vec<u16>) -> Result<()> {
        let mut instances = self.lock();
        for (other, claimed) in instances.iter().filter(|(other, _)| **other != id) {
            if let Some(port) = ports.iter().find(|port| claimed.contains(port)) {
                return Err(TorPoolError::ConfigurationError(format!(
                    "Port {} already claimed by {}",
                    port, other
                )));
            }
        }
        debug!("{} registered ports {:?}", id, ports);
        instances.insert(id, ports);
        Ok(())
    }

    /// Forget `id`. Returns whether it was registered.
    pub fn deregister(&self, id: InstanceId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!("{} deregistered", id);
        }
        removed
    }

    /// Whether `id` currently holds ports.
    pub fn contains(&self, id: InstanceId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Ports claimed by `id`.
    pub fn ports_of(&self, id: InstanceId) -> Option<Vec<u16>> {
        self.lock().get(&id).cloned()
    }

    /// Highest port claimed by any instance.
    pub fn highest_port(&self) -> Option<u16> {
        highest(&self.lock())
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no instance is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn highest(instances: &BTreeMap<InstanceId, Vec<u16>>) -> Option<u16> {
    instances.values().flatten().copied().max()
}
