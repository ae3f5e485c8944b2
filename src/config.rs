//! Settings for supervised Tor instances.
//!
//! [`InstanceConfig`] gathers the knobs that are not part of the torrc
//! itself: where the binary and data live, how many SOCKS listeners to open
//! and the timing of bootstrap, probes and the watchdog.

use crate::auth::AuthCredential;
use std::path::PathBuf;
use std::time::Duration;

/// Directory name used under the platform data directory.
pub const APP_NAME: &str = "tor-pool";

/// Default socks base port for the first instance.
pub const DEFAULT_PORT: u16 = 10080;

/// Width of the port range reserved by one instance.
pub const PORT_SPAN: u16 = 100;

/// Settings for one [`TorInstance`](crate::TorInstance).
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Tor executable. `None` means `<data root>/bin/tor`, then `tor` on `PATH`.
    pub binary_path: Option<PathBuf>,
    /// Root for `bin/` and `data/`.
    pub data_root: PathBuf,
    /// Number of socks listeners once bootstrapped.
    pub num_socks: usize,
    /// Socks port of the first instance in the process.
    pub default_port: u16,
    /// Budget for one public-IP provider attempt.
    pub probe_timeout: Duration,
    /// Delay before a failed probe is scheduled again.
    pub probe_retry_delay: Duration,
    /// Wait for one line of Tor output during bootstrap.
    pub bootstrap_read_timeout: Duration,
    /// Empty reads tolerated before any progress is seen.
    pub bootstrap_retries: u32,
    /// Interval between attempts to flush queued config changes.
    pub config_retry_delay: Duration,
    /// Interval of the background liveness check.
    pub watchdog_interval: Duration,
    /// Control port authentication.
    pub auth: AuthCredential,
    /// Control port connect timeout.
    pub control_connect_timeout: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            data_root: default_data_root(),
            num_socks: 10,
            default_port: DEFAULT_PORT,
            probe_timeout: Duration::from_secs(5),
            probe_retry_delay: Duration::from_secs(1),
            bootstrap_read_timeout: Duration::from_secs(1),
            bootstrap_retries: 3,
            config_retry_delay: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(5),
            auth: AuthCredential::Auto,
            control_connect_timeout: Duration::from_secs(10),
        }
    }
}

/// `<platform data dir>/tor-pool`, or the temp dir when there is none.
pub fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

impl InstanceConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this Tor executable.
    pub fn binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    /// Keep binaries and data directories under `root`.
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    /// Open this many socks listeners after bootstrap.
    pub fn num_socks(mut self, n: usize) -> Self {
        self.num_socks = n;
        self
    }

    /// Set the socks base port of the first instance.
    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Set the per-provider probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the delay before a failed probe is retried.
    pub fn probe_retry_delay(mut self, delay: Duration) -> Self {
        self.probe_retry_delay = delay;
        self
    }

    /// Set how long to wait for each line of bootstrap output.
    pub fn bootstrap_read_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_read_timeout = timeout;
        self
    }

    /// Set the number of empty bootstrap reads tolerated.
    pub fn bootstrap_retries(mut self, retries: u32) -> Self {
        self.bootstrap_retries = retries;
        self
    }

    /// Set the retry interval for queued config changes.
    pub fn config_retry_delay(mut self, delay: Duration) -> Self {
        self.config_retry_delay = delay;
        self
    }

    /// Set the background watchdog interval.
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Set control port authentication.
    pub fn auth(mut self, auth: AuthCredential) -> Self {
        self.auth = auth;
        self
    }

    /// Set the control port connect timeout.
    pub fn control_connect_timeout(mut self, timeout: Duration) -> Self {
        self.control_connect_timeout = timeout;
        self
    }

    /// Directory holding the Tor executable.
    pub fn bin_dir(&self) -> PathBuf {
        self.data_root.join("bin")
    }

    /// Parent of all instance data directories.
    pub fn data_dir(&self) -> PathBuf {
        self.data_root.join("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InstanceConfig::default();
        assert_eq!(config.default_port, 10080);
        assert_eq!(config.bootstrap_retries, 3);
        assert_eq!(config.watchdog_interval, Duration::from_secs(5));
        assert!(matches!(config.auth, AuthCredential::Auto));
        assert!(config.data_root.ends_with(APP_NAME));
    }

    #[test]
    fn test_config_builder() {
        let config = InstanceConfig::new()
            .data_root("/tmp/pool")
            .num_socks(4)
            .probe_timeout(Duration::from_millis(200))
            .auth(AuthCredential::None);

        assert_eq!(config.num_socks, 4);
        assert_eq!(config.probe_timeout, Duration::from_millis(200));
        assert_eq!(config.bin_dir(), PathBuf::from("/tmp/pool/bin"));
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/pool/data"));
    }
}
