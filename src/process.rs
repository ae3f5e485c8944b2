//! Spawning Tor and following its bootstrap.

use crate::auth::is_data_dir_locked;
use crate::config::{InstanceConfig, PORT_SPAN};
use crate::error::{Result, TorPoolError};
use crate::torrc::TorRc;

use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a supervised Tor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// `start` has not been called.
    #[default]
    NotStarted,
    /// Provisioning and launching the binary.
    Spawning,
    /// Waiting for `Bootstrapped 100%`.
    Bootstrapping,
    /// Process is up.
    Running,
    /// Process exited without being asked to.
    Crashed,
    /// Stopped by the caller.
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::NotStarted => "not started",
            SupervisorState::Spawning => "spawning",
            SupervisorState::Bootstrapping => "bootstrapping",
            SupervisorState::Running => "running",
            SupervisorState::Crashed => "crashed",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What the bootstrap loop should do after one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Keep reading.
    Continue,
    /// Tor reported 100%.
    Done,
    /// Too many empty reads before any progress.
    GiveUp,
}

/// Tracks `Bootstrapped N%` lines.
///
/// An empty read costs one retry, but only while no progress has been
/// seen. Once Tor reports any percentage the monitor waits indefinitely;
/// the process exiting is what ends the wait then.
#[derive(Debug)]
pub struct BootstrapMonitor {
    pattern: Regex,
    progress: u8,
    retries_left: u32,
}

impl BootstrapMonitor {
    /// A monitor tolerating `retries` empty reads before first progress.
    pub fn new(retries: u32) -> Result<Self> {
        let pattern = Regex::new(r"Bootstrapped (\d+)%")
            .map_err(|e| TorPoolError::ProtocolError(e.to_string()))?;
        Ok(Self {
            pattern,
            progress: 0,
            retries_left: retries,
        })
    }

    /// Last reported percentage.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Percentage in a log line, if it has one.
    pub fn parse_progress(&self, line: &str) -> Option<u8> {
        self.pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u8>().ok())
            .map(|p| p.min(100))
    }

    /// Feed one read: a line, or `None` when the read timed out.
    pub fn observe(&mut self, line: Option<&str>) -> BootstrapStep {
        let Some(line) = line else {
            if self.retries_left == 0 {
                return BootstrapStep::GiveUp;
            }
            if self.progress == 0 {
                self.retries_left -= 1;
            }
            return BootstrapStep::Continue;
        };

        if let Some(progress) = self.parse_progress(line) {
            self.progress = progress;
            if progress == 100 {
                return BootstrapStep::Done;
            }
        }
        BootstrapStep::Continue
    }
}

/// Read Tor's output until bootstrap completes, stalls or the process exits.
///
/// `on_progress` sees each new percentage. Returns the last percentage.
pub async fn await_bootstrap(
    lines: &mut mpsc::UnboundedReceiver<String>,
    monitor: &mut BootstrapMonitor,
    read_timeout: Duration,
    mut on_progress: impl FnMut(u8),
) -> u8 {
    loop {
        let read = match tokio::time::timeout(read_timeout, lines.recv()).await {
            Ok(Some(line)) => Some(line),
            Ok(None) => {
                debug!("Tor output closed during bootstrap");
                break;
            }
            Err(_) => None,
        };

        let before = monitor.progress();
        let step = monitor.observe(read.as_deref());
        if monitor.progress() != before {
            info!("Bootstrapped {}%", monitor.progress());
            on_progress(monitor.progress());
        }
        match step {
            BootstrapStep::Continue => {}
            BootstrapStep::Done => break,
            BootstrapStep::GiveUp => {
                warn!("Tor went quiet before bootstrapping");
                break;
            }
        }
    }
    monitor.progress()
}

/// Launch `binary __OwningControllerProcess <pid> --Key Value ...`.
///
/// Stdout and stderr are merged into one line stream. Lines keep being
/// read and logged after the receiver is dropped, so Tor never blocks on
/// a full pipe.
pub fn spawn_tor(binary: &Path, config: &TorRc) -> Result<(Child, mpsc::UnboundedReceiver<String>)> {
    let mut child = Command::new(binary)
        .arg("__OwningControllerProcess")
        .arg(std::process::id().to_string())
        .args(config.as_cmdline())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TorPoolError::Process(format!("{}: {}", binary.display(), e)))?;
    debug!("Spawned {} (pid {:?})", binary.display(), child.id());

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx));
    }
    Ok((child, rx))
}

async fn forward_lines<R>(pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(target: "tor", "{}", line);
        let _ = tx.send(line);
    }
}

/// Makes sure a Tor executable is available.
///
/// Runs on the blocking pool, so implementations may download or unpack.
pub trait BinaryProvisioner: Send + Sync {
    /// Return the path of a usable executable.
    fn provision(&self, config: &InstanceConfig) -> Result<PathBuf>;
}

/// Uses an existing installation: the configured path, `<data root>/bin/tor`,
/// or `tor` on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTor;

pub(crate) fn executable_name() -> &'static str {
    if cfg!(windows) {
        "tor.exe"
    } else {
        "tor"
    }
}

impl BinaryProvisioner for SystemTor {
    fn provision(&self, config: &InstanceConfig) -> Result<PathBuf> {
        std::fs::create_dir_all(config.bin_dir())?;
        std::fs::create_dir_all(config.data_dir())?;

        if let Some(path) = &config.binary_path {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(TorPoolError::Process(format!("{} does not exist", path.display())))
            };
        }

        let bundled = config.bin_dir().join(executable_name());
        if bundled.is_file() {
            return Ok(bundled);
        }

        std::env::var_os("PATH")
            .iter()
            .flat_map(std::env::split_paths)
            .map(|dir| dir.join(executable_name()))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| TorPoolError::Process("no tor executable found".to_string()))
    }
}

/// `base`, or its first numbered subdirectory not held by a running Tor.
pub fn choose_data_directory(base: &Path) -> PathBuf {
    if !is_data_dir_locked(base) {
        return base.to_path_buf();
    }
    (1u32..)
        .map(|n| base.join(n.to_string()))
        .find(|dir| !is_data_dir_locked(dir))
        .unwrap_or_else(|| base.to_path_buf())
}

/// Socks port list grown to `num_socks` entries.
///
/// Each new port steps by two from the previous one, skipping every port
/// the config already uses, and stays within [`PORT_SPAN`] of the first
/// socks port.
pub fn expand_socks_ports(config: &TorRc, num_socks: usize) -> Vec<u16> {
    let used = config.used_ports();
    let mut ports = config.socks_ports().to_vec();
    let Some(&first) = ports.first() else {
        return ports;
    };
    let limit = first.saturating_add(PORT_SPAN - 1);

    let mut last = ports.last().copied().unwrap_or(first);
    while ports.len() < num_socks {
        let mut candidate = last;
        while used.contains(&candidate) || ports.contains(&candidate) {
            candidate = candidate.saturating_add(2);
            if candidate >= limit {
                break;
            }
        }
        if candidate > limit || used.contains(&candidate) || ports.contains(&candidate) {
            warn!(
                "Only {} socks ports fit in {}..={}",
                ports.len(),
                first,
                limit
            );
            break;
        }
        ports.push(candidate);
        last = candidate;
    }
    ports
}
