//! Typed torrc with change notification.
//!
//! [`TorRc`] renders to command-line flags for spawning Tor and to the
//! plain `Key Value` torrc form. Every setter reports the new value to a
//! subscribed observer after the write, which is how a running instance
//! pushes live edits to its control port.

use crate::config::DEFAULT_PORT;
use crate::protocol::config_keyword;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Callback invoked after each field write.
pub type ChangeObserver = Arc<dyn Fn(&ConfigKey, &ConfigValue) + Send + Sync>;

/// A torrc option, named in snake_case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// `SocksPort`, one entry per listener.
    SocksPort,
    /// `ControlPort`.
    ControlPort,
    /// `DnsPort`.
    DnsPort,
    /// `HttpTunnelPort`.
    HttpTunnelPort,
    /// `DataDirectory`.
    DataDirectory,
    /// `NewCircuitPeriod`, in seconds.
    NewCircuitPeriod,
    /// `CookieAuthentication`.
    CookieAuthentication,
    /// `EnforceDistinctSubnets`.
    EnforceDistinctSubnets,
    /// `HashedControlPassword`. Never rendered.
    HashedControlPassword,
    /// Any other option, stored by its snake_case name.
    Extra(String),
}

impl ConfigKey {
    /// The snake_case field name.
    pub fn name(&self) -> &str {
        match self {
            ConfigKey::SocksPort => "socks_port",
            ConfigKey::ControlPort => "control_port",
            ConfigKey::DnsPort => "dns_port",
            ConfigKey::HttpTunnelPort => "http_tunnel_port",
            ConfigKey::DataDirectory => "data_directory",
            ConfigKey::NewCircuitPeriod => "new_circuit_period",
            ConfigKey::CookieAuthentication => "cookie_authentication",
            ConfigKey::EnforceDistinctSubnets => "enforce_distinct_subnets",
            ConfigKey::HashedControlPassword => "hashed_control_password",
            ConfigKey::Extra(name) => name,
        }
    }

    /// The PascalCase keyword Tor expects.
    pub fn keyword(&self) -> String {
        config_keyword(self.name())
    }

    /// Internal keys start with `_` and are never rendered.
    pub fn is_internal(&self) -> bool {
        self.name().starts_with('_')
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A rendered option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// A single value.
    Scalar(String),
    /// One value per repetition of the keyword.
    List(Vec<String>),
}

impl ConfigValue {
    /// The value as the list of strings SETCONF sends.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            ConfigValue::Scalar(v) => vec![v.clone()],
            ConfigValue::List(values) => values.clone(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Scalar(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Scalar(v)
    }
}

impl From<u16> for ConfigValue {
    fn from(v: u16) -> Self {
        ConfigValue::Scalar(v.to_string())
    }
}

impl From<u32> for ConfigValue {
    fn from(v: u32) -> Self {
        ConfigValue::Scalar(v.to_string())
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Scalar(if v { "1" } else { "0" }.to_string())
    }
}

impl From<&Path> for ConfigValue {
    fn from(v: &Path) -> Self {
        ConfigValue::Scalar(v.display().to_string())
    }
}

impl<T: ToString> From<Vec<T>> for ConfigValue {
    fn from(values: Vec<T>) -> Self {
        ConfigValue::List(values.iter().map(ToString::to_string).collect())
    }
}

/// Configuration of one Tor process.
///
/// Socks ports are kept free of duplicates. Cloning yields an unsubscribed
/// copy, so edits to the clone never reach a running process.
pub struct TorRc {
    socks_ports: Vec<u16>,
    control_port: u16,
    dns_port: u16,
    http_tunnel_port: u16,
    data_directory: PathBuf,
    new_circuit_period: u32,
    cookie_authentication: bool,
    enforce_distinct_subnets: bool,
    hashed_control_password: Option<String>,
    extra: Vec<(String, ConfigValue)>,
    observer: Option<ChangeObserver>,
}

impl TorRc {
    /// Default layout: one socks port at 10080, control/DNS/HTTP-tunnel on
    /// the three ports after it.
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self::with_socks_ports(vec![DEFAULT_PORT], data_directory)
    }

    /// Layout derived from `socks_ports`: control, DNS and HTTP-tunnel
    /// ports are the first socks port plus 1, 2 and 3.
    pub fn with_socks_ports(socks_ports: Vec<u16>, data_directory: impl Into<PathBuf>) -> Self {
        let socks_ports = if socks_ports.is_empty() {
            vec![DEFAULT_PORT]
        } else {
            dedup(socks_ports)
        };
        let first = socks_ports[0];

        Self {
            socks_ports,
            control_port: first.saturating_add(1),
            dns_port: first.saturating_add(2),
            http_tunnel_port: first.saturating_add(3),
            data_directory: data_directory.into(),
            new_circuit_period: 15,
            cookie_authentication: true,
            enforce_distinct_subnets: false,
            hashed_control_password: None,
            extra: Vec::new(),
            observer: None,
        }
    }

    /// Report every subsequent write to `observer`, replacing any earlier one.
    pub fn subscribe(&mut self, observer: ChangeObserver) {
        self.observer = Some(observer);
    }

    /// Stop reporting writes.
    pub fn unsubscribe(&mut self) {
        self.observer = None;
    }

    fn notify(&self, key: ConfigKey, value: ConfigValue) {
        if let Some(observer) = &self.observer {
            observer(&key, &value);
        }
    }

    /// Socks listener ports, in order.
    pub fn socks_ports(&self) -> &[u16] {
        &self.socks_ports
    }

    /// Control port.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// DNS port.
    pub fn dns_port(&self) -> u16 {
        self.dns_port
    }

    /// HTTP CONNECT tunnel port.
    pub fn http_tunnel_port(&self) -> u16 {
        self.http_tunnel_port
    }

    /// Tor's data directory.
    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Seconds between fresh circuits.
    pub fn new_circuit_period(&self) -> u32 {
        self.new_circuit_period
    }

    /// Whether Tor writes a control auth cookie.
    pub fn cookie_authentication(&self) -> bool {
        self.cookie_authentication
    }

    /// Whether circuit hops must be in distinct /16s.
    pub fn enforce_distinct_subnets(&self) -> bool {
        self.enforce_distinct_subnets
    }

    /// Hashed control password, if one was set.
    pub fn hashed_control_password(&self) -> Option<&str> {
        self.hashed_control_password.as_deref()
    }

    /// Value of an extra option set with [`TorRc::set_option`].
    pub fn option(&self, key: &str) -> Option<&ConfigValue> {
        self.extra.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Replace the socks port list. Duplicates are dropped, first wins.
    pub fn set_socks_ports(&mut self, ports: Vec<u16>) {
        self.socks_ports = dedup(ports);
        self.notify(ConfigKey::SocksPort, self.socks_ports.clone().into());
    }

    /// Set the control port.
    pub fn set_control_port(&mut self, port: u16) {
        self.control_port = port;
        self.notify(ConfigKey::ControlPort, port.into());
    }

    /// Set the DNS port.
    pub fn set_dns_port(&mut self, port: u16) {
        self.dns_port = port;
        self.notify(ConfigKey::DnsPort, port.into());
    }

    /// Set the HTTP tunnel port.
    pub fn set_http_tunnel_port(&mut self, port: u16) {
        self.http_tunnel_port = port;
        self.notify(ConfigKey::HttpTunnelPort, port.into());
    }

    /// Set the data directory.
    pub fn set_data_directory(&mut self, dir: impl Into<PathBuf>) {
        self.data_directory = dir.into();
        self.notify(ConfigKey::DataDirectory, self.data_directory.as_path().into());
    }

    /// Set the new-circuit period in seconds.
    pub fn set_new_circuit_period(&mut self, seconds: u32) {
        self.new_circuit_period = seconds;
        self.notify(ConfigKey::NewCircuitPeriod, seconds.into());
    }

    /// Toggle cookie authentication.
    pub fn set_cookie_authentication(&mut self, enabled: bool) {
        self.cookie_authentication = enabled;
        self.notify(ConfigKey::CookieAuthentication, enabled.into());
    }

    /// Toggle distinct-subnet enforcement.
    pub fn set_enforce_distinct_subnets(&mut self, enabled: bool) {
        self.enforce_distinct_subnets = enabled;
        self.notify(ConfigKey::EnforceDistinctSubnets, enabled.into());
    }

    /// Stored and reported, never rendered.
    pub fn set_hashed_control_password(&mut self, hash: impl Into<String>) {
        let hash = hash.into();
        self.hashed_control_password = Some(hash.clone());
        self.notify(ConfigKey::HashedControlPassword, hash.into());
    }

    /// Set any other option by its snake_case name.
    ///
    /// Extra options render after the named fields, in the order they were
    /// first set.
    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        let key = key.into();
        let value = value.into();
        match self.extra.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value.clone(),
            None => self.extra.push((key.clone(), value.clone())),
        }
        self.notify(ConfigKey::Extra(key), value);
    }

    /// Every port this config listens on.
    pub fn used_ports(&self) -> Vec<u16> {
        let mut ports = self.socks_ports.clone();
        ports.extend([self.control_port, self.dns_port, self.http_tunnel_port]);
        ports
    }

    /// Rendered options in field order.
    pub fn entries(&self) -> Vec<(ConfigKey, ConfigValue)> {
        let mut entries = vec![
            (ConfigKey::SocksPort, self.socks_ports.clone().into()),
            (ConfigKey::ControlPort, self.control_port.into()),
            (ConfigKey::DnsPort, self.dns_port.into()),
            (ConfigKey::HttpTunnelPort, self.http_tunnel_port.into()),
            (ConfigKey::DataDirectory, self.data_directory.as_path().into()),
            (ConfigKey::NewCircuitPeriod, self.new_circuit_period.into()),
            (ConfigKey::CookieAuthentication, self.cookie_authentication.into()),
            (ConfigKey::EnforceDistinctSubnets, self.enforce_distinct_subnets.into()),
        ];
        entries.extend(
            self.extra
                .iter()
                .map(|(k, v)| (ConfigKey::Extra(k.clone()), v.clone()))
                .filter(|(k, _)| !k.is_internal()),
        );
        entries
    }

    /// `--Key Value` pairs, one pair per list element.
    pub fn as_cmdline(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .flat_map(|(key, value)| {
                let flag = format!("--{}", key.keyword());
                value
                    .to_list()
                    .into_iter()
                    .flat_map(move |v| [flag.clone(), v])
            })
            .collect()
    }

    /// torrc file contents, one `Key Value` line per list element.
    pub fn as_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.entries() {
            let keyword = key.keyword();
            for v in value.to_list() {
                out.push_str(&keyword);
                out.push(' ');
                out.push_str(&v);
                out.push('\n');
            }
        }
        out
    }

    /// [`TorRc::as_string`] as UTF-8 bytes.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.as_string().into_bytes()
    }
}

fn dedup(ports: Vec<u16>) -> Vec<u16> {
    let mut seen = Vec::with_capacity(ports.len());
    for port in ports {
        if !seen.contains(&port) {
            seen.push(port);
        }
    }
    seen
}

impl Clone for TorRc {
    fn clone(&self) -> Self {
        Self {
            socks_ports: self.socks_ports.clone(),
            control_port: self.control_port,
            dns_port: self.dns_port,
            http_tunnel_port: self.http_tunnel_port,
            data_directory: self.data_directory.clone(),
            new_circuit_period: self.new_circuit_period,
            cookie_authentication: self.cookie_authentication,
            enforce_distinct_subnets: self.enforce_distinct_subnets,
            hashed_control_password: self.hashed_control_password.clone(),
            extra: self.extra.clone(),
            observer: None,
        }
    }
}

impl fmt::Debug for TorRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorRc")
            .field("socks_ports", &self.socks_ports)
            .field("control_port", &self.control_port)
            .field("dns_port", &self.dns_port)
            .field("http_tunnel_port", &self.http_tunnel_port)
            .field("data_directory", &self.data_directory)
            .field("new_circuit_period", &self.new_circuit_period)
            .field("cookie_authentication", &self.cookie_authentication)
            .field("enforce_distinct_subnets", &self.enforce_distinct_subnets)
            .field("extra", &self.extra)
            .field("subscribed", &self.observer.is_some())
            .finish()
    }
}
