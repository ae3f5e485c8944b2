//! Running an instance on its own thread.
//!
//! [`run_in_background`] moves a [`TorInstance`] onto a dedicated OS thread
//! with a private current-thread runtime. The thread starts Tor, then
//! checks it every watchdog interval and starts it again whenever it is
//! not running. Between checks it keeps the proxy pool refreshed so new
//! socks ports get probed.
//!
//! Dropping the [`BackgroundHandle`] detaches the supervisor; it keeps
//! running until the process exits. Send [`SupervisorCommand::Shutdown`]
//! to stop Tor and end the thread.

use crate::control::ControlChannel;
use crate::error::{Result, TorPoolError};
use crate::instance::TorInstance;
use crate::pool::ProxyPool;

use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Intent sent to a background supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Kill Tor and start it again with the same config.
    Restart,
    /// Stop Tor and end the supervisor thread.
    Shutdown,
}

/// Access to an instance supervised on another thread.
#[derive(Debug)]
pub struct BackgroundHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    pool: ProxyPool,
    control: Arc<ControlChannel>,
    thread: thread::JoinHandle<()>,
}

impl BackgroundHandle {
    /// The instance's proxy pool. Measurements fill in as probes finish.
    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    /// The instance's control channel.
    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    /// Send a command to the supervisor.
    pub fn send(&self, command: SupervisorCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TorPoolError::Process("background supervisor has exited".to_string()))
    }

    /// Ask for a restart.
    pub fn restart(&self) -> Result<()> {
        self.send(SupervisorCommand::Restart)
    }

    /// Ask the supervisor to stop Tor and exit.
    pub fn shutdown(&self) -> Result<()> {
        self.send(SupervisorCommand::Shutdown)
    }

    /// Whether the supervisor thread has ended.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the supervisor thread to end. Only returns after a
    /// [`shutdown`](Self::shutdown).
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| TorPoolError::Process("background supervisor panicked".to_string()))
    }
}

/// Supervise `instance` on a new thread.
pub fn run_in_background(instance: TorInstance) -> Result<BackgroundHandle> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = instance.pool().clone();
    let control = Arc::clone(instance.control());
    pool.attach_runtime(runtime.handle().clone());

    let name = format!("{}-supervisor", instance.id());
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || runtime.block_on(supervise(instance, rx)))?;

    Ok(BackgroundHandle {
        commands: tx,
        pool,
        control,
        thread,
    })
}

async fn supervise(mut instance: TorInstance, mut commands: mpsc::UnboundedReceiver<SupervisorCommand>) {
    start(&mut instance).await;

    let mut watchdog = tokio::time::interval(instance.settings().watchdog_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    watchdog.tick().await;
    let mut attached = true;

    loop {
        tokio::select! {
            _ = watchdog.tick() => {
                if instance.running() {
                    instance.proxies();
                } else {
                    info!("{} is not running, restarting", instance.id());
                    start(&mut instance).await;
                }
            }
            command = commands.recv(), if attached => match command {
                Some(SupervisorCommand::Restart) => {
                    info!("{} restart requested", instance.id());
                    start(&mut instance).await;
                }
                Some(SupervisorCommand::Shutdown) => {
                    if let Err(e) = instance.stop().await {
                        warn!("{} did not stop cleanly: {}", instance.id(), e);
                    }
                    break;
                }
                None => {
                    debug!("{} supervisor detached", instance.id());
                    attached = false;
                }
            },
        }
    }
    debug!("{} supervisor exiting", instance.id());
}

async fn start(instance: &mut TorInstance) {
    match instance.start(None).await {
        Ok(()) => {
            instance.proxies();
        }
        Err(e) => warn!("{} failed to start: {}", instance.id(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::ports::InstanceRegistry;
    use std::time::Duration;

    #[test]
    fn test_shutdown_ends_thread() {
        let root = std::env::temp_dir().join(format!("tor-pool-bg-{}", std::process::id()));
        let registry = Arc::new(InstanceRegistry::new());
        let settings = InstanceConfig::new()
            .data_root(&root)
            .default_port(0)
            .binary_path(root.join("missing-tor"))
            .watchdog_interval(Duration::from_secs(1));
        let instance = TorInstance::with_registry(settings, registry.clone());
        let id = instance.id();

        let handle = run_in_background(instance).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(!handle.is_finished());
        assert!(registry.contains(id));
        assert_eq!(handle.control().bootstrap(), 0);

        handle.restart().unwrap();
        handle.shutdown().unwrap();
        handle.join().unwrap();
        assert!(!registry.contains(id));
        let _ = std::fs::remove_dir_all(&root);
    }
}
