//! # tor-pool
//!
//! Supervise local Tor processes and use them as a pool of SOCKS5 proxies.
//!
//! A [`TorInstance`] launches Tor, follows its bootstrap, and opens a set
//! of socks listeners. Each listener becomes a [`ProxyEndpoint`] in the
//! instance's [`ProxyPool`], where a background health check keeps its
//! latency and exit IP up to date. Config edits made through [`TorRc`] are
//! pushed to the running process over the control port without a restart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tor_pool::{InstanceConfig, Result, TorInstance};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut tor = TorInstance::new(InstanceConfig::new().num_socks(5));
//!     tor.start(None).await?;
//!     println!("Bootstrapped {}%", tor.bootstrap());
//!
//!     for proxy in tor.proxies() {
//!         println!("{}", proxy.socks_url());
//!     }
//!
//!     tor.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Live Configuration
//!
//! Writes to the instance's config are applied with `SETCONF` once Tor has
//! bootstrapped. Earlier writes are queued and applied in order.
//!
//! ```rust,no_run
//! # use tor_pool::{InstanceConfig, TorInstance};
//! # async fn example() -> tor_pool::Result<()> {
//! # let mut tor = TorInstance::new(InstanceConfig::new());
//! # tor.start(None).await?;
//! if let Some(config) = tor.config_mut() {
//!     config.set_new_circuit_period(30);
//!     config.set_option("exit_nodes", "{de},{nl}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## New Identity
//!
//! ```rust,no_run
//! # use tor_pool::{InstanceConfig, TorInstance};
//! # async fn example() -> tor_pool::Result<()> {
//! # let mut tor = TorInstance::new(InstanceConfig::new());
//! # tor.start(None).await?;
//! // Returns false while Tor's NEWNYM rate limit is running
//! if tor.request_new_identity().await? {
//!     println!("New circuits, endpoints are being measured again");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Background Supervision
//!
//! ```rust,no_run
//! use tor_pool::{run_in_background, InstanceConfig, TorInstance};
//!
//! # fn example() -> tor_pool::Result<()> {
//! let handle = run_in_background(TorInstance::new(InstanceConfig::new()))?;
//! if let Some(proxy) = handle.pool().fastest() {
//!     println!("Fastest: {}", proxy);
//! }
//! handle.shutdown()?;
//! handle.join()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `tokio-runtime` (default): process supervision, control channel,
//!   socks client and proxy pool
//! - `test-utils`: mock control and socks servers for downstream tests

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ports;
pub mod protocol;
pub mod torrc;

#[cfg(feature = "tokio-runtime")]
pub mod background;
#[cfg(feature = "tokio-runtime")]
pub mod connection;
#[cfg(feature = "tokio-runtime")]
pub mod control;
#[cfg(feature = "tokio-runtime")]
pub mod health;
#[cfg(feature = "tokio-runtime")]
pub mod instance;
#[cfg(feature = "tokio-runtime")]
pub mod pool;
#[cfg(feature = "tokio-runtime")]
pub mod process;
#[cfg(feature = "tokio-runtime")]
pub mod socks;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export main types for convenience
pub use error::{Result, StatusCode, TorPoolError};

pub use auth::{AuthCredential, AuthMethod, ProtocolInfo};
pub use config::{InstanceConfig, DEFAULT_PORT, PORT_SPAN};
pub use endpoint::{Measurements, ProxyEndpoint, ProxyScheme};
pub use ports::{free_port, InstanceId, InstanceRegistry};
pub use protocol::{Reply, ReplyLine, Signal};
pub use torrc::{ChangeObserver, ConfigKey, ConfigValue, TorRc};

#[cfg(feature = "tokio-runtime")]
pub use background::{run_in_background, BackgroundHandle, SupervisorCommand};
#[cfg(feature = "tokio-runtime")]
pub use connection::ControlConnection;
#[cfg(feature = "tokio-runtime")]
pub use control::ControlChannel;
#[cfg(feature = "tokio-runtime")]
pub use health::{ConnectionOpener, HealthChecker, IpProvider, ProbeOutcome};
#[cfg(feature = "tokio-runtime")]
pub use instance::TorInstance;
#[cfg(feature = "tokio-runtime")]
pub use pool::ProxyPool;
#[cfg(feature = "tokio-runtime")]
pub use process::{BinaryProvisioner, SupervisorState, SystemTor};
#[cfg(feature = "tokio-runtime")]
pub use socks::{ProxyStream, SocksClient, TargetAddr};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
