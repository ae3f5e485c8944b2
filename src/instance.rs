//! One supervised Tor process together with its config, control channel and
//! proxy pool.

use crate::config::InstanceConfig;
use crate::control::ControlChannel;
use crate::endpoint::ProxyEndpoint;
use crate::error::{Result, TorPoolError};
use crate::health::HealthChecker;
use crate::pool::ProxyPool;
use crate::ports::{InstanceId, InstanceRegistry};
use crate::process::{
    await_bootstrap, choose_data_directory, executable_name, expand_socks_ports, spawn_tor,
    BinaryProvisioner, BootstrapMonitor, SupervisorState, SystemTor,
};
use crate::torrc::{ConfigKey, ConfigValue, TorRc};

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Child;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// A Tor process exposed as a pool of socks endpoints.
///
/// ```rust,no_run
/// use tor_pool::{InstanceConfig, TorInstance};
///
/// # async fn example() -> tor_pool::Result<()> {
/// let mut tor = TorInstance::new(InstanceConfig::new().num_socks(4));
/// tor.start(None).await?;
///
/// for proxy in tor.proxies() {
///     println!("{}", proxy.socks_url());
/// }
///
/// tor.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct TorInstance {
    id: InstanceId,
    settings: InstanceConfig,
    registry: Arc<InstanceRegistry>,
    provisioner: Arc<dyn BinaryProvisioner>,
    control: Arc<ControlChannel>,
    pool: ProxyPool,
    config: Option<TorRc>,
    binary: Option<PathBuf>,
    child: Option<Child>,
    state: SupervisorState,
}

impl TorInstance {
    /// An instance using the process-wide registry.
    pub fn new(settings: InstanceConfig) -> Self {
        Self::with_registry(settings, InstanceRegistry::shared())
    }

    /// An instance reserving its ports in `registry`.
    pub fn with_registry(settings: InstanceConfig, registry: Arc<InstanceRegistry>) -> Self {
        let checker = HealthChecker::new(settings.probe_timeout);
        let pool = ProxyPool::new(checker, settings.probe_retry_delay);
        Self {
            id: InstanceId::next(),
            control: Arc::new(ControlChannel::from_config(&settings)),
            pool,
            registry,
            provisioner: Arc::new(SystemTor),
            settings,
            config: None,
            binary: None,
            child: None,
            state: SupervisorState::NotStarted,
        }
    }

    /// An instance that starts with `config` instead of a generated one.
    pub fn with_config(settings: InstanceConfig, config: TorRc) -> Self {
        let mut instance = Self::new(settings);
        instance.config = Some(config);
        instance
    }

    /// Replace the binary lookup.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn BinaryProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Start Tor and wait for it to bootstrap.
    ///
    /// `config` wins over the config of a previous run, which wins over a
    /// freshly generated one. Failing to launch or to reach 100% is logged
    /// and leaves [`bootstrap`](Self::bootstrap) below 100. Only port
    /// errors are returned: allocation failing, or a config whose ports
    /// another instance in the registry already holds. Such a config is
    /// never launched.
    pub async fn start(&mut self, config: Option<TorRc>) -> Result<()> {
        self.kill_child().await?;
        self.control.reset().await;
        self.state = SupervisorState::Spawning;
        self.pool.attach_runtime(Handle::current());

        let binary = self.provision().await;

        let mut config = match config.or_else(|| self.config.take()) {
            Some(config) => config,
            None => self.fresh_config()?,
        };
        if let Err(e) = self.registry.register(self.id, config.used_ports()) {
            warn!("{} not launched: {}", self.id, e);
            self.state = SupervisorState::Crashed;
            return Err(e);
        }
        if let Err(e) = std::fs::create_dir_all(config.data_directory()) {
            warn!("{} cannot create {}: {}", self.id, config.data_directory().display(), e);
        }

        let control = Arc::clone(&self.control);
        config.subscribe(Arc::new(move |key: &ConfigKey, value: &ConfigValue| {
            control.enqueue(key.clone(), value.clone())
        }));
        self.control.bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, config.control_port())),
            config.data_directory(),
        );

        let spawned = spawn_tor(&binary, &config);
        self.config = Some(config);
        self.binary = Some(binary);

        let (child, mut lines) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!("{} failed to launch Tor: {}", self.id, e);
                self.state = SupervisorState::Crashed;
                return Ok(());
            }
        };
        self.child = Some(child);
        self.state = SupervisorState::Bootstrapping;
        self.control.set_process_alive(true);
        self.control.start_worker();

        let mut monitor = BootstrapMonitor::new(self.settings.bootstrap_retries)?;
        let control = Arc::clone(&self.control);
        let progress = await_bootstrap(
            &mut lines,
            &mut monitor,
            self.settings.bootstrap_read_timeout,
            |percent| control.set_bootstrap(percent),
        )
        .await;
        drop(lines);

        self.state = SupervisorState::Running;
        if !self.running() {
            return Ok(());
        }
        if progress == 100 {
            info!("{} bootstrapped", self.id);
            self.expand_socks();
        } else {
            warn!("{} stopped bootstrapping at {}%", self.id, progress);
        }
        Ok(())
    }

    async fn provision(&self) -> PathBuf {
        let settings = self.settings.clone();
        let provisioner = Arc::clone(&self.provisioner);
        let fallback = settings
            .binary_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(executable_name()));

        match tokio::task::spawn_blocking(move || provisioner.provision(&settings)).await {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                warn!("Tor binary unavailable: {}", e);
                fallback
            }
            Err(e) => {
                warn!("Provisioning task failed: {}", e);
                fallback
            }
        }
    }

    fn fresh_config(&self) -> Result<TorRc> {
        let data_directory = choose_data_directory(&self.settings.data_dir());
        let base = self.registry.allocate(self.id, self.settings.default_port)?;
        debug!("{} using {} with socks base {}", self.id, data_directory.display(), base);
        Ok(TorRc::with_socks_ports(vec![base], data_directory))
    }

    fn expand_socks(&mut self) {
        let Some(config) = self.config.as_mut() else {
            return;
        };
        let ports = expand_socks_ports(config, self.settings.num_socks);
        if ports.len() <= config.socks_ports().len() {
            return;
        }
        let mut claim = ports.clone();
        claim.extend(config.used_ports().into_iter().filter(|p| !ports.contains(p)));
        if let Err(e) = self.registry.register(self.id, claim) {
            warn!("{} keeps its socks ports: {}", self.id, e);
            return;
        }
        info!("{} opening socks ports {:?}", self.id, ports);
        config.set_socks_ports(ports);
    }

    async fn kill_child(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                child.kill().await?;
            }
        }
        Ok(())
    }

    /// Kill Tor and release its ports.
    ///
    /// Returns `false` when the instance was not registered, in which case
    /// nothing happens.
    pub async fn stop(&mut self) -> Result<bool> {
        if !self.registry.contains(self.id) {
            debug!("{} is not registered", self.id);
            return Ok(false);
        }

        self.control.reset().await;
        self.pool.shutdown();
        if let Some(mut config) = self.config.take() {
            config.unsubscribe();
        }
        self.registry.deregister(self.id);
        self.state = SupervisorState::Stopped;
        self.kill_child().await?;
        info!("{} stopped", self.id);
        Ok(true)
    }

    /// Whether the Tor process exists and has not exited.
    ///
    /// Seeing an exit that nobody asked for marks the instance crashed.
    pub fn running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if matches!(
                    self.state,
                    SupervisorState::Running | SupervisorState::Bootstrapping
                ) {
                    warn!("{} exited unexpectedly: {}", self.id, status);
                    self.state = SupervisorState::Crashed;
                }
                self.control.set_process_alive(false);
                false
            }
            Err(e) => {
                warn!("{} status unavailable: {}", self.id, e);
                false
            }
        }
    }

    /// Refresh the pool from the current config and return its endpoints.
    pub fn proxies(&self) -> Vec<ProxyEndpoint> {
        match &self.config {
            Some(config) => self.pool.refresh(config),
            None => Vec::new(),
        }
    }

    /// Ask Tor for new circuits. See [`ControlChannel::request_new_identity`].
    pub async fn request_new_identity(&self) -> Result<bool> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| TorPoolError::ControlUnavailable(format!("{} has no config", self.id)))?;
        self.control.request_new_identity(&self.pool, config).await
    }

    /// Registry key of this instance.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Last bootstrap percentage.
    pub fn bootstrap(&self) -> u8 {
        self.control.bootstrap()
    }

    /// Lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Settings this instance was built with.
    pub fn settings(&self) -> &InstanceConfig {
        &self.settings
    }

    /// Binary used by the last start.
    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    /// Current torrc.
    pub fn config(&self) -> Option<&TorRc> {
        self.config.as_ref()
    }

    /// Current torrc for live edits. Writes are pushed to Tor.
    pub fn config_mut(&mut self) -> Option<&mut TorRc> {
        self.config.as_mut()
    }

    /// The proxy pool.
    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    /// The control channel.
    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }
}

impl Drop for TorInstance {
    fn drop(&mut self) {
        self.pool.shutdown();
        self.registry.deregister(self.id);
    }
}

impl std::fmt::Debug for TorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorInstance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("bootstrap", &self.bootstrap())
            .field("config", &self.config)
            .finish()
    }
}
