//! Error types for the proxy pool.
//!
//! Every fallible operation in the crate returns [`Result`], whose error
//! side is [`TorPoolError`]. Control-port replies carry a [`StatusCode`].

use std::io;
use thiserror::Error;

/// The main error type for all pool, process and control operations.
#[derive(Error, Debug)]
pub enum TorPoolError {
    /// Socket, pipe or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection to a control port or proxy failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication with Tor failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command was rejected by Tor.
    #[error("Command rejected (code {code}): {message}")]
    CommandRejected {
        /// The status code returned by Tor.
        code: u16,
        /// The human-readable error message.
        message: String,
    },

    /// A reply or log line did not have the expected shape.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Unusable settings, such as an exhausted port range.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A connect or reply deadline passed.
    #[error("Operation timed out")]
    Timeout,

    /// The connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The control channel cannot be used yet (process not bootstrapped).
    #[error("Control channel unavailable: {0}")]
    ControlUnavailable(String),

    /// The SOCKS5 proxy refused or garbled the handshake.
    #[error("SOCKS handshake failed: {0}")]
    SocksHandshake(String),

    /// The target address cannot be encoded into a CONNECT request.
    #[error("Unsupported SOCKS address type for '{0}'")]
    UnsupportedAddressType(String),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// No public-IP provider produced an answer through the endpoint.
    #[error("Could not retrieve the public IP for {endpoint} from any provider")]
    LookupFailed {
        /// The `socks5://host:port` url of the endpoint that was probed.
        endpoint: String,
    },

    /// The Tor process could not be spawned or supervised.
    #[error("Process error: {0}")]
    Process(String),
}

impl TorPoolError {
    /// Whether this error means the underlying control socket is gone.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            TorPoolError::ConnectionClosed => true,
            TorPoolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, TorPoolError>;

/// Control reply codes this crate acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 250
    Ok = 250,
    /// 251, accepted but nothing changed.
    OperationUnnecessary = 251,
    /// 451, e.g. a rate limit.
    ResourceExhausted = 451,
    /// 514
    AuthenticationRequired = 514,
    /// 515
    BadAuthentication = 515,
    /// 552, unknown config option.
    UnrecognizedEntity = 552,
    /// 553, SETCONF value refused.
    InvalidConfigValue = 553,
    /// Any other code.
    Other = 0,
}

impl StatusCode {
    /// Classify a numeric reply code.
    pub fn from_u16(code: u16) -> Self {
        match code {
            250 => StatusCode::Ok,
            251 => StatusCode::OperationUnnecessary,
            451 => StatusCode::ResourceExhausted,
            514 => StatusCode::AuthenticationRequired,
            515 => StatusCode::BadAuthentication,
            552 => StatusCode::UnrecognizedEntity,
            553 => StatusCode::InvalidConfigValue,
            _ => StatusCode::Other,
        }
    }

    /// 2xx codes Tor uses for success.
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::OperationUnnecessary)
    }

    /// Whether Tor wants the controller to authenticate first.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            StatusCode::AuthenticationRequired | StatusCode::BadAuthentication
        )
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode::from_u16(code)
    }
}
