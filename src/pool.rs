//! The live proxy pool.
//!
//! [`ProxyPool::refresh`] derives the endpoint list from a [`TorRc`] and
//! makes sure every endpoint that lacks a latency or public IP has exactly
//! one probe in flight. Probes write their results into the endpoint that
//! currently holds their port. A failed probe is scheduled again after a
//! short delay until it succeeds or its port leaves the pool.

use crate::endpoint::ProxyEndpoint;
use crate::error::Result;
use crate::health::{HealthChecker, ProbeOutcome};
use crate::torrc::TorRc;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Host that Tor's socks listeners bind to.
pub const LOCAL_HOST: &str = "127.0.0.1";

/// A running probe. `id` tells a stale completion from the current one.
struct Probe {
    id: u64,
    task: JoinHandle<()>,
}

struct Shared {
    endpoints: Mutex<Vec<ProxyEndpoint>>,
    in_flight: Mutex<HashMap<u16, Probe>>,
    next_probe: AtomicU64,
    checker: HealthChecker,
    retry_delay: Duration,
    cursor: AtomicUsize,
    runtime: Mutex<Option<Handle>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Endpoints of one instance and their probes.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProxyPool {
    shared: Arc<Shared>,
}

impl ProxyPool {
    /// An empty pool measuring endpoints with `checker`.
    pub fn new(checker: HealthChecker, retry_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoints: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_probe: AtomicU64::new(0),
                checker,
                retry_delay,
                cursor: AtomicUsize::new(0),
                runtime: Mutex::new(Handle::try_current().ok()),
            }),
        }
    }

    /// Spawn probes on `handle` when called from outside a runtime.
    pub fn attach_runtime(&self, handle: Handle) {
        *lock(&self.shared.runtime) = Some(handle);
    }

    /// Rebuild the endpoint list from `config` and schedule missing probes.
    ///
    /// Endpoints whose port is still configured are carried over with their
    /// measurements. Calling this repeatedly never starts a second probe for
    /// a port that already has one running.
    pub fn refresh(&self, config: &TorRc) -> Vec<ProxyEndpoint> {
        let rebuilt = {
            let mut endpoints = lock(&self.shared.endpoints);
            let previous = std::mem::take(&mut *endpoints);
            *endpoints = config
                .socks_ports()
                .iter()
                .map(|&port| {
                    previous
                        .iter()
                        .find(|e| e.port() == port)
                        .cloned()
                        .unwrap_or_else(|| ProxyEndpoint::new(LOCAL_HOST, port))
                })
                .collect();
            endpoints.clone()
        };

        let mut in_flight = lock(&self.shared.in_flight);
        in_flight.retain(|port, probe| {
            let keep = rebuilt.iter().any(|e| e.port() == *port);
            if !keep {
                probe.task.abort();
            }
            keep
        });
        for endpoint in rebuilt.iter().filter(|e| !e.is_measured()) {
            schedule(&self.shared, &mut in_flight, endpoint.clone(), None);
        }

        rebuilt
    }

    /// Current endpoints, without refreshing.
    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        lock(&self.shared.endpoints).clone()
    }

    /// Endpoints in rotation, one per call.
    pub fn next_endpoint(&self) -> Option<ProxyEndpoint> {
        let endpoints = lock(&self.shared.endpoints);
        if endpoints.is_empty() {
            return None;
        }
        let i = self.shared.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Some(endpoints[i].clone())
    }

    /// The endpoint with the lowest measured latency.
    pub fn fastest(&self) -> Option<ProxyEndpoint> {
        lock(&self.shared.endpoints)
            .iter()
            .filter_map(|e| e.latency().map(|l| (l, e)))
            .min_by_key(|(l, _)| *l)
            .map(|(_, e)| e.clone())
    }

    /// Number of probes currently running.
    pub fn probes_in_flight(&self) -> usize {
        lock(&self.shared.in_flight)
            .values()
            .filter(|p| !p.task.is_finished())
            .count()
    }

    /// Drop all measurements and cancel running probes.
    ///
    /// Used after an identity change, when every exit may have moved.
    pub fn clear_measurements(&self) {
        abort_all(&self.shared);
        let now = Instant::now();
        for endpoint in lock(&self.shared.endpoints).iter() {
            endpoint.reset(now);
        }
    }

    /// Cancel probes and forget every endpoint.
    pub fn shutdown(&self) {
        abort_all(&self.shared);
        lock(&self.shared.endpoints).clear();
        debug!("Proxy pool shut down");
    }
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // One lock at a time; `complete` takes in_flight before endpoints.
        let endpoints = lock(&self.shared.endpoints).len();
        let probes = self.probes_in_flight();
        f.debug_struct("ProxyPool")
            .field("endpoints", &endpoints)
            .field("probes_in_flight", &probes)
            .finish()
    }
}

fn abort_all(shared: &Shared) {
    for (_, probe) in lock(&shared.in_flight).drain() {
        probe.task.abort();
    }
}

fn runtime(shared: &Shared) -> Option<Handle> {
    Handle::try_current()
        .ok()
        .or_else(|| lock(&shared.runtime).clone())
}

/// Start a probe for `endpoint` unless one is already running for its port.
fn schedule(
    shared: &Arc<Shared>,
    in_flight: &mut HashMap<u16, Probe>,
    endpoint: ProxyEndpoint,
    delay: Option<Duration>,
) {
    let port = endpoint.port();
    if in_flight.get(&port).is_some_and(|p| !p.task.is_finished()) {
        trace!("Probe for port {} already running", port);
        return;
    }
    let Some(handle) = runtime(shared) else {
        warn!("No runtime to probe {} on", endpoint);
        return;
    };

    let id = shared.next_probe.fetch_add(1, Ordering::Relaxed);
    let task_shared = shared.clone();
    let task = handle.spawn(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = task_shared.checker.probe(&endpoint).await;
        complete(&task_shared, port, id, result);
    });
    in_flight.insert(port, Probe { id, task });
}

/// Store a probe result, or try again if the port is still wanted.
fn complete(shared: &Arc<Shared>, port: u16, id: u64, result: Result<ProbeOutcome>) {
    let mut in_flight = lock(&shared.in_flight);
    if in_flight.get(&port).map(|p| p.id) != Some(id) {
        trace!("Probe {} for port {} was superseded", id, port);
        return;
    }
    in_flight.remove(&port);

    let current = lock(&shared.endpoints)
        .iter()
        .find(|e| e.port() == port)
        .cloned();
    let Some(endpoint) = current else {
        trace!("Port {} left the pool, dropping probe result", port);
        return;
    };

    match result {
        Ok(outcome) => endpoint.record(outcome.public_ip, outcome.provider, outcome.latency),
        Err(e) => {
            debug!("Probe of {} failed, retrying: {}", endpoint, e);
            schedule(shared, &mut in_flight, endpoint, Some(shared.retry_delay));
        }
    }
}
