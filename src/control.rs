//! Lazily authenticated control channel of a running instance.
//!
//! The channel is only usable once the process exists and has bootstrapped
//! to 100%. Config edits made before that are queued and flushed in order
//! by a background worker. The authenticated connection is cached and
//! replaced when its socket is seen closing.

use crate::auth::AuthCredential;
use crate::config::InstanceConfig;
use crate::connection::ControlConnection;
use crate::error::{Result, TorPoolError};
use crate::pool::ProxyPool;
use crate::protocol::Signal;
use crate::torrc::{ConfigKey, ConfigValue, TorRc};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Tor rate-limits NEWNYM to one every ten seconds.
pub const NEWNYM_COOLDOWN: Duration = Duration::from_secs(10);

/// A config edit waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    /// Option that changed.
    pub key: ConfigKey,
    /// Its new value.
    pub value: ConfigValue,
}

#[derive(Debug, Clone)]
struct Target {
    addr: SocketAddr,
    data_directory: PathBuf,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control port access for one instance.
pub struct ControlChannel {
    auth: AuthCredential,
    connect_timeout: Duration,
    retry_delay: Duration,
    bootstrap: AtomicU8,
    process_alive: AtomicBool,
    target: Mutex<Option<Target>>,
    conn: tokio::sync::Mutex<Option<ControlConnection>>,
    queue_tx: Mutex<mpsc::UnboundedSender<ConfigChange>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<ConfigChange>>>,
    pending: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_newnym: Mutex<Option<Instant>>,
}

impl ControlChannel {
    /// A channel that is not yet bound to any control port.
    pub fn new(auth: AuthCredential, connect_timeout: Duration, retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            auth,
            connect_timeout,
            retry_delay,
            bootstrap: AtomicU8::new(0),
            process_alive: AtomicBool::new(false),
            target: Mutex::new(None),
            conn: tokio::sync::Mutex::new(None),
            queue_tx: Mutex::new(tx),
            queue_rx: Mutex::new(Some(rx)),
            pending: AtomicUsize::new(0),
            worker: Mutex::new(None),
            last_newnym: Mutex::new(None),
        }
    }

    /// A channel using the auth and timing settings of `config`.
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(
            config.auth.clone(),
            config.control_connect_timeout,
            config.config_retry_delay,
        )
    }

    /// Point the channel at a control port and the data directory holding
    /// its auth cookie.
    pub fn bind(&self, addr: SocketAddr, data_directory: impl Into<PathBuf>) {
        *lock(&self.target) = Some(Target {
            addr,
            data_directory: data_directory.into(),
        });
    }

    /// Record bootstrap progress.
    pub fn set_bootstrap(&self, percent: u8) {
        self.bootstrap.store(percent.min(100), Ordering::SeqCst);
    }

    /// Last recorded bootstrap progress.
    pub fn bootstrap(&self) -> u8 {
        self.bootstrap.load(Ordering::SeqCst)
    }

    /// Record whether the Tor process is running.
    pub fn set_process_alive(&self, alive: bool) {
        self.process_alive.store(alive, Ordering::SeqCst);
    }

    /// The process exists and has fully bootstrapped.
    pub fn is_ready(&self) -> bool {
        self.process_alive.load(Ordering::SeqCst)
            && self.bootstrap() == 100
            && lock(&self.target).is_some()
    }

    /// Changes queued but not yet applied.
    pub fn pending_changes(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue a change for the worker. Never blocks.
    pub fn enqueue(&self, key: ConfigKey, value: ConfigValue) {
        trace!("Queueing config change {}", key);
        self.pending.fetch_add(1, Ordering::SeqCst);
        if lock(&self.queue_tx).send(ConfigChange { key, value }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Config queue closed, change dropped");
        }
    }

    /// Apply a change now if the channel is ready and nothing is queued
    /// ahead of it; otherwise queue it. A change that fails because the
    /// control port cannot be reached yet is queued as well.
    ///
    /// Returns whether the change was applied immediately.
    pub async fn apply_config_change(&self, key: ConfigKey, value: ConfigValue) -> Result<bool> {
        let mut guard = self.conn.lock().await;
        if !self.is_ready() || self.pending_changes() > 0 {
            drop(guard);
            self.enqueue(key, value);
            return Ok(false);
        }
        match self.set_conf(&mut guard, &key, &value).await {
            Ok(()) => Ok(true),
            Err(e) if is_transient(&e) => {
                drop(guard);
                debug!("Change {} deferred: {}", key, e);
                self.enqueue(key, value);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Spawn the queue worker on the current runtime if it is not running.
    pub fn start_worker(self: &Arc<Self>) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime for the config worker");
            return;
        };

        let rx = lock(&self.queue_rx).take().unwrap_or_else(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            *lock(&self.queue_tx) = tx;
            self.pending.store(0, Ordering::SeqCst);
            rx
        });
        *worker = Some(handle.spawn(self.clone().drain(rx)));
    }

    async fn drain(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ConfigChange>) {
        while let Some(change) = rx.recv().await {
            loop {
                let mut guard = self.conn.lock().await;
                match self.set_conf(&mut guard, &change.key, &change.value).await {
                    Ok(()) => {
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                        break;
                    }
                    Err(e) if is_transient(&e) => {
                        drop(guard);
                        trace!("Change {} deferred: {}", change.key, e);
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    Err(e) => {
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                        warn!("Dropping config change {}: {}", change.key, e);
                        break;
                    }
                }
            }
        }
    }

    async fn set_conf(
        &self,
        guard: &mut Option<ControlConnection>,
        key: &ConfigKey,
        value: &ConfigValue,
    ) -> Result<()> {
        let keyword = key.keyword();
        let values = value.to_list();
        for attempt in 0..2 {
            let conn = match self.connection(guard).await {
                Ok(conn) => conn,
                Err(e) if attempt == 0 && is_retryable(&e) => {
                    debug!("Control connection failed, retrying: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match conn.set_conf(&keyword, &values).await {
                Err(e) if attempt == 0 && e.is_connection_lost() => {
                    debug!("Control socket closed during SETCONF {}, reconnecting", keyword);
                    *guard = None;
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    debug!("Applied {}={:?}", keyword, values);
                    return Ok(());
                }
            }
        }
        Err(TorPoolError::ConnectionClosed)
    }

    /// The cached connection, opening and authenticating one if needed.
    async fn connection<'a>(
        &self,
        guard: &'a mut Option<ControlConnection>,
    ) -> Result<&'a mut ControlConnection> {
        if !self.is_ready() {
            return Err(TorPoolError::ControlUnavailable(format!(
                "bootstrap at {}%",
                self.bootstrap()
            )));
        }
        if guard.as_ref().is_some_and(|c| !c.is_alive()) {
            debug!("Discarding dead control connection");
            *guard = None;
        }

        if guard.is_none() {
            let target = lock(&self.target).clone().ok_or_else(|| {
                TorPoolError::ControlUnavailable("no control port bound".to_string())
            })?;
            let mut conn = ControlConnection::connect(target.addr, self.connect_timeout).await?;
            conn.authenticate(&self.auth, Some(&target.data_directory))
                .await?;
            debug!("Control connection to {} authenticated", target.addr);
            *guard = Some(conn);
        }
        guard
            .as_mut()
            .ok_or_else(|| TorPoolError::ControlUnavailable("no control connection".to_string()))
    }

    /// Time until Tor accepts another NEWNYM.
    pub fn newnym_wait(&self) -> Duration {
        lock(&self.last_newnym)
            .map(|at| NEWNYM_COOLDOWN.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Switch to clean circuits and re-measure every endpoint.
    ///
    /// Returns `false` without signalling while Tor's NEWNYM rate limit is
    /// still running.
    pub async fn request_new_identity(&self, pool: &ProxyPool, config: &TorRc) -> Result<bool> {
        let wait = self.newnym_wait();
        if !wait.is_zero() {
            debug!("NEWNYM rate-limited for another {:?}", wait);
            return Ok(false);
        }

        {
            let mut guard = self.conn.lock().await;
            self.signal(&mut guard, Signal::NewNym).await?;
        }
        *lock(&self.last_newnym) = Some(Instant::now());
        info!("New identity requested");

        pool.clear_measurements();
        pool.refresh(config);
        Ok(true)
    }

    async fn signal(&self, guard: &mut Option<ControlConnection>, signal: Signal) -> Result<()> {
        for attempt in 0..2 {
            let conn = self.connection(guard).await?;
            match conn.signal(signal).await {
                Err(e) if attempt == 0 && e.is_connection_lost() => *guard = None,
                other => return other,
            }
        }
        Err(TorPoolError::ConnectionClosed)
    }

    /// Run a GETINFO query.
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let mut guard = self.conn.lock().await;
        let conn = self.connection(&mut guard).await?;
        let result = conn.get_info(key).await;
        if result.as_ref().is_err_and(TorPoolError::is_connection_lost) {
            *guard = None;
        }
        result
    }

    /// Stop the worker, drop queued changes and close the connection.
    pub async fn reset(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.queue_tx) = tx;
        *lock(&self.queue_rx) = Some(rx);
        self.pending.store(0, Ordering::SeqCst);

        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.quit().await;
        }
        self.set_process_alive(false);
        self.set_bootstrap(0);
        *lock(&self.target) = None;
        *lock(&self.last_newnym) = None;
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("target", &lock(&self.target).as_ref().map(|t| t.addr))
            .field("bootstrap", &self.bootstrap())
            .field("pending", &self.pending_changes())
            .finish()
    }
}

/// Errors that clear up by themselves: not bootstrapped yet, or the socket
/// went away.
fn is_transient(e: &TorPoolError) -> bool {
    e.is_connection_lost()
        || matches!(
            e,
            TorPoolError::ControlUnavailable(_)
                | TorPoolError::ConnectionFailed(_)
                | TorPoolError::Timeout
                | TorPoolError::Io(_)
        )
}

fn is_retryable(e: &TorPoolError) -> bool {
    e.is_connection_lost() || matches!(e, TorPoolError::AuthenticationFailed(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthChecker;
    use crate::test_utils::MockControlServer;

    fn channel(server: &MockControlServer) -> Arc<ControlChannel> {
        let channel = Arc::new(ControlChannel::new(
            AuthCredential::Auto,
            Duration::from_secs(2),
            Duration::from_millis(20),
        ));
        channel.bind(server.address(), std::env::temp_dir());
        channel
    }

    fn ready(channel: &ControlChannel) {
        channel.set_process_alive(true);
        channel.set_bootstrap(100);
    }

    async fn wait_for_commands(server: &MockControlServer, prefix: &str, n: usize) {
        for _ in 0..200 {
            if server.commands_starting_with(prefix).len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} '{}' commands, saw {:?}", n, prefix, server.commands());
    }

    #[tokio::test]
    async fn test_not_ready_until_bootstrapped() {
        let server = MockControlServer::start().await;
        let channel = channel(&server);
        assert!(!channel.is_ready());

        channel.set_process_alive(true);
        channel.set_bootstrap(99);
        assert!(!channel.is_ready());
        assert!(matches!(
            channel.get_info("version").await,
            Err(TorPoolError::ControlUnavailable(_))
        ));

        channel.set_bootstrap(100);
        assert_eq!(channel.get_info("version").await.unwrap(), "0.4.8.12");
    }

    #[tokio::test]
    async fn test_deferred_change_applied_exactly_once() {
        let server = MockControlServer::start().await;
        let channel = channel(&server);
        channel.start_worker();

        channel.enqueue(ConfigKey::SocksPort, vec![10080u16, 10084].into());
        let applied = channel
            .apply_config_change(ConfigKey::NewCircuitPeriod, 30u32.into())
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(channel.pending_changes(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.commands_starting_with("SETCONF").is_empty());

        ready(&channel);
        wait_for_commands(&server, "SETCONF", 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            server.commands_starting_with("SETCONF"),
            vec![
                "SETCONF SocksPort=10080 SocksPort=10084".to_string(),
                "SETCONF NewCircuitPeriod=30".to_string(),
            ]
        );
        assert_eq!(channel.pending_changes(), 0);
    }

    #[tokio::test]
    async fn test_ready_change_applies_immediately() {
        let server = MockControlServer::start().await;
        let channel = channel(&server);
        ready(&channel);

        let applied = channel
            .apply_config_change(ConfigKey::DnsPort, 10082u16.into())
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(server.commands_starting_with("SETCONF"), vec!["SETCONF DnsPort=10082"]);
    }

    #[tokio::test]
    async fn test_unreachable_port_defers_change() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let server = MockControlServer::start().await;
        let channel = channel(&server);
        channel.bind(closed_addr, std::env::temp_dir());
        ready(&channel);

        let applied = channel
            .apply_config_change(ConfigKey::NewCircuitPeriod, 45u32.into())
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(channel.pending_changes(), 1);

        channel.bind(server.address(), std::env::temp_dir());
        channel.start_worker();
        wait_for_commands(&server, "SETCONF", 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(server.commands_starting_with("SETCONF"), vec!["SETCONF NewCircuitPeriod=45"]);
        assert_eq!(channel.pending_changes(), 0);
    }

    #[tokio::test]
    async fn test_closed_socket_retries_on_fresh_connection() {
        let server = MockControlServer::start().await;
        let channel = channel(&server);
        ready(&channel);

        channel
            .apply_config_change(ConfigKey::DnsPort, 10082u16.into())
            .await
            .unwrap();
        server.close_on_next_command();
        channel
            .apply_config_change(ConfigKey::DnsPort, 10092u16.into())
            .await
            .unwrap();

        assert_eq!(server.connection_count(), 2);
        assert_eq!(
            server.commands_starting_with("SETCONF"),
            vec!["SETCONF DnsPort=10082", "SETCONF DnsPort=10092"]
        );
    }

    #[tokio::test]
    async fn test_new_identity_respects_cooldown() {
        let server = MockControlServer::start().await;
        let channel = channel(&server);
        ready(&channel);

        let pool = ProxyPool::new(HealthChecker::new(Duration::from_millis(50)), Duration::from_secs(60));
        let config = TorRc::with_socks_ports(vec![1], "d");
        let endpoint = pool.refresh(&config).remove(0);
        endpoint.record("1.2.3.4".into(), "ip.test".into(), Duration::from_millis(80));

        assert!(channel.request_new_identity(&pool, &config).await.unwrap());
        assert!(!channel.newnym_wait().is_zero());
        assert_eq!(endpoint.latency(), None);
        assert_eq!(endpoint.public_ip(), None);
        assert!(endpoint.measurements().identity_changed_at.is_some());

        endpoint.record("5.6.7.8".into(), "ip.test".into(), Duration::from_millis(90));
        assert!(!channel.request_new_identity(&pool, &config).await.unwrap());
        assert_eq!(endpoint.latency(), Some(Duration::from_millis(90)));
        assert_eq!(endpoint.public_ip().as_deref(), Some("5.6.7.8"));

        assert_eq!(server.commands_starting_with("SIGNAL"), vec!["SIGNAL NEWNYM"]);
        assert_eq!(pool.endpoints().len(), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_reset_drops_queue() {
        let server = MockControlServer::start().await;
        let channel = channel(&server);
        channel.start_worker();
        channel.enqueue(ConfigKey::DnsPort, 1u16.into());

        channel.reset().await;
        assert_eq!(channel.pending_changes(), 0);
        assert!(!channel.is_ready());
    }
}
