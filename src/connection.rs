//! A single control-port connection.
//!
//! [`ControlConnection`] speaks the line protocol: it writes one command,
//! reads the full reply and tracks whether the socket is still usable.
//! Lazy connection management lives one level up in [`crate::control`].

use crate::auth::{read_cookie_file, AuthCredential, AuthMethod, ProtocolInfo, SafeCookie};
use crate::error::{Result, TorPoolError};
use crate::protocol::{format_command, format_setconf, Reply, ReplyLine, Signal};

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// An open connection to a Tor control port.
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    alive: bool,
}

impl ControlConnection {
    /// Connect to a control port, giving up after `connect_timeout`.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TorPoolError::Timeout)?
            .map_err(|e| TorPoolError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            alive: true,
        })
    }

    /// Whether the socket has not yet been seen closing or failing.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Send a raw command and receive the reply.
    pub async fn send_command(&mut self, command: &str) -> Result<Reply> {
        if !self.alive {
            return Err(TorPoolError::ConnectionClosed);
        }
        trace!("Sending command: {}", command.trim());

        let result = self.exchange(command).await;
        if let Err(ref e) = result {
            if e.is_connection_lost() {
                self.alive = false;
            }
        }
        result
    }

    async fn exchange(&mut self, command: &str) -> Result<Reply> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    /// Read a complete reply from Tor.
    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();

        loop {
            let raw = self.read_line().await?;
            let reply_line = ReplyLine::parse(&raw)?;
            let is_end = reply_line.is_end();

            if reply_line.is_data() {
                // Data block runs until a lone "." line.
                let mut data_lines = Vec::new();
                loop {
                    let data_line = self.read_line().await?;
                    if data_line == "." {
                        break;
                    }
                    let unescaped = data_line.strip_prefix('.').unwrap_or(&data_line);
                    data_lines.push(unescaped.to_string());
                }
                lines.push(ReplyLine {
                    text: format!("{}\n{}", reply_line.text, data_lines.join("\n")),
                    ..reply_line
                });
            } else {
                lines.push(reply_line);
            }

            if is_end {
                break;
            }
        }

        Reply::new(lines)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(TorPoolError::ConnectionClosed);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("Received line: {}", trimmed);
        Ok(trimmed)
    }

    /// Ask Tor which authentication methods it accepts.
    pub async fn protocol_info(&mut self) -> Result<ProtocolInfo> {
        let reply = self.send_command("PROTOCOLINFO 1\r\n").await?.into_result()?;
        let lines: Vec<&str> = reply.lines.iter().map(|l| l.text.as_str()).collect();
        Ok(ProtocolInfo::parse(&lines))
    }

    /// Authenticate with the given credential.
    ///
    /// `data_directory` supplies the cookie location when Tor does not
    /// advertise one in PROTOCOLINFO.
    pub async fn authenticate(
        &mut self,
        credential: &AuthCredential,
        data_directory: Option<&Path>,
    ) -> Result<()> {
        let credential = match credential {
            AuthCredential::Auto => self.pick_credential(data_directory).await?,
            other => other.clone(),
        };

        match &credential {
            AuthCredential::Auto | AuthCredential::None => {
                debug!("Authenticating with NULL method");
                self.send_command("AUTHENTICATE\r\n").await?.into_result()?;
            }
            AuthCredential::Cookie(path) => {
                debug!("Authenticating with cookie file {}", path.display());
                let cookie = read_cookie_file(path)?;
                let cmd = format_command("AUTHENTICATE", &[&hex::encode_upper(cookie)]);
                self.send_command(&cmd).await?.into_result()?;
            }
            AuthCredential::SafeCookie(path) => {
                debug!("Authenticating with SAFECOOKIE");
                let exchange = SafeCookie::new(read_cookie_file(path)?);
                let nonce = exchange.client_nonce_hex();
                let cmd = format_command("AUTHCHALLENGE", &["SAFECOOKIE", &nonce]);
                let challenge = self.send_command(&cmd).await?.into_result()?;
                let client_hash = exchange.respond(challenge.first_line())?;
                let cmd = format_command("AUTHENTICATE", &[&client_hash]);
                self.send_command(&cmd).await?.into_result()?;
            }
        }

        debug!("Authentication successful");
        Ok(())
    }

    /// Pick the strongest method PROTOCOLINFO allows that we can satisfy.
    async fn pick_credential(&mut self, data_directory: Option<&Path>) -> Result<AuthCredential> {
        let info = self.protocol_info().await?;
        let cookie = info
            .cookie_file
            .clone()
            .or_else(|| data_directory.map(crate::auth::cookie_path));

        match cookie {
            _ if info.supports(AuthMethod::Null) => Ok(AuthCredential::None),
            Some(path) if info.supports(AuthMethod::SafeCookie) => {
                Ok(AuthCredential::SafeCookie(path))
            }
            Some(path) if info.supports(AuthMethod::Cookie) => Ok(AuthCredential::Cookie(path)),
            _ => Err(TorPoolError::AuthenticationFailed(
                "No supported authentication method".to_string(),
            )),
        }
    }

    /// Assign a keyword its full list of values.
    pub async fn set_conf(&mut self, keyword: &str, values: &[String]) -> Result<()> {
        let cmd = format_setconf(keyword, values);
        self.send_command(&cmd).await?.into_result()?;
        Ok(())
    }

    /// Get a single GETINFO value.
    pub async fn get_info(&mut self, key: &str) -> Result<String> {
        let cmd = format_command("GETINFO", &[key]);
        let reply = self.send_command(&cmd).await?.into_result()?;
        reply
            .value_of(key)
            .map(str::to_string)
            .ok_or_else(|| TorPoolError::ProtocolError(format!("Key '{}' not found in response", key)))
    }

    /// Send a signal to Tor.
    pub async fn signal(&mut self, signal: Signal) -> Result<()> {
        let cmd = format_command("SIGNAL", &[signal.as_str()]);
        self.send_command(&cmd).await?.into_result()?;
        Ok(())
    }

    /// Close the connection politely.
    pub async fn quit(&mut self) {
        let _ = self.send_command("QUIT\r\n").await;
        self.alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockControlServer;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_null_auth_and_setconf() {
        let server = MockControlServer::start().await;
        let mut conn = ControlConnection::connect(server.address(), TIMEOUT).await.unwrap();

        conn.authenticate(&AuthCredential::Auto, None).await.unwrap();
        conn.set_conf("SocksPort", &["10080".to_string(), "10084".to_string()])
            .await
            .unwrap();

        let commands = server.commands();
        assert!(commands.contains(&"PROTOCOLINFO 1".to_string()));
        assert!(commands.contains(&"AUTHENTICATE".to_string()));
        assert!(commands.contains(&"SETCONF SocksPort=10080 SocksPort=10084".to_string()));
    }

    #[tokio::test]
    async fn test_get_info_reads_value() {
        let server = MockControlServer::start().await;
        let mut conn = ControlConnection::connect(server.address(), TIMEOUT).await.unwrap();
        let version = conn.get_info("version").await.unwrap();
        assert_eq!(version, "0.4.8.12");
    }

    #[tokio::test]
    async fn test_closed_socket_marks_connection_dead() {
        let server = MockControlServer::start().await;
        let mut conn = ControlConnection::connect(server.address(), TIMEOUT).await.unwrap();
        server.close_on_next_command();

        let err = conn.signal(Signal::NewNym).await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(ControlConnection::connect(addr, TIMEOUT).await.is_err());
    }
}
