//! One SOCKS listener exposed by a Tor instance.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Proxy protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyScheme {
    /// SOCKS5, the default for Tor's SocksPort.
    #[default]
    Socks5,
    /// SOCKS4a.
    Socks4,
}

impl ProxyScheme {
    /// URL scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks4 => "socks4",
        }
    }
}

/// Measurements taken through an endpoint.
#[derive(Debug, Clone, Default)]
pub struct Measurements {
    /// Time to open a tunnel; `None` until measured.
    pub latency: Option<Duration>,
    /// Exit address seen by a public-IP provider; `None` until measured.
    pub public_ip: Option<String>,
    /// Host of the provider that reported `public_ip`.
    pub provider: Option<String>,
    /// When the instance last switched to clean circuits.
    pub identity_changed_at: Option<Instant>,
}

impl Measurements {
    /// Both latency and public IP are known.
    pub fn is_complete(&self) -> bool {
        self.latency.is_some() && self.public_ip.is_some()
    }
}

struct Inner {
    host: String,
    port: u16,
    scheme: ProxyScheme,
    measurements: Mutex<Measurements>,
}

/// A proxy endpoint with its live measurements.
///
/// Clones share measurements, so a probe holding a clone updates what the
/// pool hands out.
#[derive(Clone)]
pub struct ProxyEndpoint {
    inner: Arc<Inner>,
}

impl ProxyEndpoint {
    /// A SOCKS5 endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_scheme(host, port, ProxyScheme::Socks5)
    }

    /// An endpoint speaking `scheme`.
    pub fn with_scheme(host: impl Into<String>, port: u16, scheme: ProxyScheme) -> Self {
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                scheme,
                measurements: Mutex::new(Measurements::default()),
            }),
        }
    }

    /// A SOCKS5 endpoint on the loopback interface.
    pub fn local(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// Proxy host.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Proxy port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Proxy protocol.
    pub fn scheme(&self) -> ProxyScheme {
        self.inner.scheme
    }

    /// `scheme://host:port`.
    pub fn socks_url(&self) -> String {
        format!("{}://{}:{}", self.scheme().as_str(), self.host(), self.port())
    }

    fn lock(&self) -> MutexGuard<'_, Measurements> {
        self.inner
            .measurements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current measurements.
    pub fn measurements(&self) -> Measurements {
        self.lock().clone()
    }

    /// Last measured tunnel setup time.
    pub fn latency(&self) -> Option<Duration> {
        self.lock().latency
    }

    /// Last observed exit address.
    pub fn public_ip(&self) -> Option<String> {
        self.lock().public_ip.clone()
    }

    /// Provider that reported the exit address.
    pub fn provider(&self) -> Option<String> {
        self.lock().provider.clone()
    }

    /// Whether latency and public IP are both known.
    pub fn is_measured(&self) -> bool {
        self.lock().is_complete()
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub(crate) fn record(&self, public_ip: String, provider: String, latency: Duration) {
        let mut m = self.lock();
        m.public_ip = Some(public_ip);
        m.provider = Some(provider);
        m.latency = Some(latency);
    }

    /// Forget latency and IP after an identity change.
    pub(crate) fn reset(&self, at: Instant) {
        let mut m = self.lock();
        m.latency = None;
        m.public_ip = None;
        m.provider = None;
        m.identity_changed_at = Some(at);
    }

    /// Whether two handles point at the same endpoint.
    pub fn same_as(&self, other: &ProxyEndpoint) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socks_url())
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.measurements();
        f.debug_struct("ProxyEndpoint")
            .field("url", &self.socks_url())
            .field("latency", &m.latency)
            .field("public_ip", &m.public_ip)
            .finish()
    }
}
