//! Control-port authentication.
//!
//! Instances are started with `CookieAuthentication 1`, so Tor writes a
//! 32-byte cookie into the data directory. The controller proves knowledge
//! of that cookie with SAFECOOKIE when available, falling back to plain
//! COOKIE. The cookie file doubles as the data directory's lock indicator.

use crate::error::{Result, TorPoolError};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Path, PathBuf};

type HmacSha256 = Hmac<Sha256>;

/// Name of the cookie file Tor writes into its data directory.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

const SERVER_HASH_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
const CLIENT_HASH_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// Path of the authentication cookie inside a data directory.
pub fn cookie_path(data_directory: &Path) -> PathBuf {
    data_directory.join(COOKIE_FILE_NAME)
}

/// A data directory is in use by a live Tor when its cookie file exists.
pub fn is_data_dir_locked(data_directory: &Path) -> bool {
    cookie_path(data_directory).is_file()
}

/// Authentication methods advertised in PROTOCOLINFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required.
    Null,
    /// Password authentication.
    HashedPassword,
    /// Cookie file authentication.
    Cookie,
    /// Safe cookie authentication (HMAC-based).
    SafeCookie,
}

impl AuthMethod {
    /// Parse an auth method from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NULL" => Some(AuthMethod::Null),
            "HASHEDPASSWORD" => Some(AuthMethod::HashedPassword),
            "COOKIE" => Some(AuthMethod::Cookie),
            "SAFECOOKIE" => Some(AuthMethod::SafeCookie),
            _ => None,
        }
    }
}

/// Information retrieved from the PROTOCOLINFO command.
#[derive(Debug, Clone, Default)]
pub struct ProtocolInfo {
    /// Supported authentication methods.
    pub auth_methods: Vec<AuthMethod>,
    /// Path to the cookie file, if Tor advertised one.
    pub cookie_file: Option<PathBuf>,
    /// Tor version string.
    pub tor_version: String,
}

impl ProtocolInfo {
    /// Parse PROTOCOLINFO reply lines (status prefixes already stripped).
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut info = ProtocolInfo::default();

        for line in lines {
            let line = line.as_ref().trim();
            if let Some(rest) = line.strip_prefix("AUTH ") {
                for part in rest.split_whitespace() {
                    if let Some(methods) = part.strip_prefix("METHODS=") {
                        info.auth_methods
                            .extend(methods.split(',').filter_map(AuthMethod::parse));
                    } else if let Some(file) = part.strip_prefix("COOKIEFILE=") {
                        info.cookie_file = Some(PathBuf::from(file.trim_matches('"')));
                    }
                }
            } else if let Some(ver) = line.strip_prefix("VERSION Tor=") {
                info.tor_version = ver.trim_matches('"').to_string();
            }
        }

        info
    }

    /// Check whether Tor accepts the given method.
    pub fn supports(&self, method: AuthMethod) -> bool {
        self.auth_methods.contains(&method)
    }
}

/// How the controller should authenticate.
#[derive(Debug, Clone, Default)]
pub enum AuthCredential {
    /// Ask PROTOCOLINFO and pick the strongest method we can satisfy.
    #[default]
    Auto,
    /// NULL authentication.
    None,
    /// Send the cookie file's contents in hex.
    Cookie(PathBuf),
    /// HMAC challenge/response over the cookie file.
    SafeCookie(PathBuf),
}

/// Read the authentication cookie from a file.
pub fn read_cookie_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|e| {
        TorPoolError::AuthenticationFailed(format!(
            "Failed to read cookie file '{}': {}",
            path.display(),
            e
        ))
    })?;

    if data.len() != 32 {
        return Err(TorPoolError::AuthenticationFailed(format!(
            "Cookie file has invalid length {} (expected 32)",
            data.len()
        )));
    }

    Ok(data)
}

/// State of one SAFECOOKIE exchange.
pub struct SafeCookie {
    cookie: Vec<u8>,
    client_nonce: [u8; 32],
}

impl SafeCookie {
    /// Start an exchange with a fresh random client nonce.
    pub fn new(cookie: Vec<u8>) -> Self {
        use rand::Rng;
        let mut client_nonce = [0u8; 32];
        rand::rng().fill(&mut client_nonce);
        Self {
            cookie,
            client_nonce,
        }
    }

    /// Hex nonce for `AUTHCHALLENGE SAFECOOKIE <nonce>`.
    pub fn client_nonce_hex(&self) -> String {
        hex::encode_upper(self.client_nonce)
    }

    /// Verify Tor's AUTHCHALLENGE reply and compute the hex client hash to
    /// send with AUTHENTICATE.
    pub fn respond(&self, challenge_line: &str) -> Result<String> {
        let (server_hash, server_nonce) = parse_authchallenge(challenge_line)?;

        let expected = self.hmac(SERVER_HASH_KEY, &server_nonce)?;
        if !constant_time_eq(&expected, &server_hash) {
            return Err(TorPoolError::AuthenticationFailed(
                "Server hash verification failed".to_string(),
            ));
        }

        Ok(hex::encode_upper(self.hmac(CLIENT_HASH_KEY, &server_nonce)?))
    }

    fn hmac(&self, key: &[u8], server_nonce: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| TorPoolError::AuthenticationFailed(e.to_string()))?;
        mac.update(&self.cookie);
        mac.update(&self.client_nonce);
        mac.update(server_nonce);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Parse `AUTHCHALLENGE SERVERHASH=... SERVERNONCE=...`.
fn parse_authchallenge(text: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut server_hash = None;
    let mut server_nonce = None;

    for part in text.split_whitespace() {
        if let Some(hash) = part.strip_prefix("SERVERHASH=") {
            server_hash = Some(hex::decode(hash).map_err(|e| {
                TorPoolError::ProtocolError(format!("Invalid SERVERHASH hex: {}", e))
            })?);
        } else if let Some(nonce) = part.strip_prefix("SERVERNONCE=") {
            server_nonce = Some(hex::decode(nonce).map_err(|e| {
                TorPoolError::ProtocolError(format!("Invalid SERVERNONCE hex: {}", e))
            })?);
        }
    }

    match (server_hash, server_nonce) {
        (Some(hash), Some(nonce)) if hash.len() == 32 && nonce.len() == 32 => Ok((hash, nonce)),
        (Some(_), Some(_)) => Err(TorPoolError::ProtocolError(
            "AUTHCHALLENGE values must be 32 bytes".to_string(),
        )),
        _ => Err(TorPoolError::ProtocolError(format!(
            "Malformed AUTHCHALLENGE reply: '{}'",
            text
        ))),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_info_parsing() {
        let lines = [
            "PROTOCOLINFO 1",
            "AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/tmp/data/control_auth_cookie\"",
            "VERSION Tor=\"0.4.8.12\"",
            "OK",
        ];

        let info = ProtocolInfo::parse(&lines);
        assert_eq!(info.tor_version, "0.4.8.12");
        assert!(info.supports(AuthMethod::Cookie));
        assert!(info.supports(AuthMethod::SafeCookie));
        assert!(!info.supports(AuthMethod::Null));
        assert_eq!(
            info.cookie_file,
            Some(PathBuf::from("/tmp/data/control_auth_cookie"))
        );
    }

    #[test]
    fn test_safecookie_round_trip_against_server_hash() {
        let cookie = vec![7u8; 32];
        let exchange = SafeCookie::new(cookie.clone());
        let server_nonce = [9u8; 32];

        // What Tor would compute on its side.
        let mut mac = HmacSha256::new_from_slice(SERVER_HASH_KEY).unwrap();
        mac.update(&cookie);
        mac.update(&exchange.client_nonce);
        mac.update(&server_nonce);
        let server_hash = hex::encode_upper(mac.finalize().into_bytes());

        let line = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            server_hash,
            hex::encode_upper(server_nonce)
        );
        let client_hash = exchange.respond(&line).unwrap();
        assert_eq!(client_hash.len(), 64);
        assert_ne!(client_hash, server_hash);
    }

    #[test]
    fn test_safecookie_rejects_forged_server_hash() {
        let exchange = SafeCookie::new(vec![1u8; 32]);
        let line = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            "00".repeat(32),
            "11".repeat(32)
        );
        assert!(matches!(
            exchange.respond(&line),
            Err(TorPoolError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_lock_indicator() {
        let dir = std::env::temp_dir().join(format!("tor-pool-lock-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(!is_data_dir_locked(&dir));
        std::fs::write(cookie_path(&dir), [0u8; 32]).unwrap();
        assert!(is_data_dir_locked(&dir));
        assert_eq!(read_cookie_file(&cookie_path(&dir)).unwrap().len(), 32);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
