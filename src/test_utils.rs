//! # Test utilities
//!
//! Mock peers for exercising the pool without a real Tor binary.
//!
//! Compiled for this crate's own tests, and for downstream crates with the
//! `test-utils` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tor-pool = { version = "0.1", features = ["test-utils"] }
//! ```
//!
//! - [`MockControlServer`] answers the control protocol with canned
//!   replies and records every command it receives.
//! - [`MockSocksServer`] performs the server side of a no-auth SOCKS5
//!   handshake, then either echoes bytes back or serves one HTTP/1.0 JSON
//!   response.
//! - [`MockTorResponse`] builds reply text line by line.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Canned replies used by [`MockControlServer`].
pub mod fixtures {
    /// PROTOCOLINFO reply advertising NULL authentication.
    pub fn protocolinfo_response() -> &'static str {
        "250-PROTOCOLINFO 1\r\n\
         250-AUTH METHODS=NULL\r\n\
         250-VERSION Tor=\"0.4.8.12\"\r\n\
         250 OK\r\n"
    }

    /// GETINFO version reply.
    pub fn version_response() -> &'static str {
        "250-version=0.4.8.12\r\n\
         250 OK\r\n"
    }

    /// Generic success.
    pub fn ok_response() -> &'static str {
        "250 OK\r\n"
    }

    /// A Tor stdout excerpt covering a full bootstrap.
    pub fn bootstrap_log() -> Vec<&'static str> {
        vec![
            "Oct 16 10:00:00.000 [notice] Tor 0.4.8.12 running on Linux.",
            "Oct 16 10:00:01.000 [notice] Bootstrapped 0% (starting): Starting",
            "Oct 16 10:00:02.000 [notice] Bootstrapped 45% (requesting_descriptors): Asking for relay descriptors",
            "Oct 16 10:00:03.000 [notice] Bootstrapped 100% (done): Done",
        ]
    }
}

/// Builder for control-protocol reply text.
#[derive(Debug, Clone, Default)]
pub struct MockTorResponse {
    lines: Vec<String>,
}

impl MockTorResponse {
    /// Create a new empty response builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mid-reply `250-` line.
    pub fn data_line(mut self, line: &str) -> Self {
        self.lines.push(format!("250-{}", line));
        self
    }

    /// Add the final OK line.
    pub fn finish(mut self) -> Self {
        self.lines.push("250 OK".to_string());
        self
    }

    /// Build the response as a CRLF-terminated string.
    pub fn build(&self) -> String {
        self.lines.iter().map(|l| format!("{}\r\n", l)).collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ControlState {
    commands: Mutex<Vec<String>>,
    close_next: AtomicBool,
    connections: AtomicUsize,
}

/// A fake Tor control port bound to an ephemeral local port.
pub struct MockControlServer {
    address: SocketAddr,
    state: Arc<ControlState>,
}

impl MockControlServer {
    /// Bind and start accepting connections in the background.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock control port");
        let address = listener.local_addr().expect("mock control address");
        let state = Arc::new(ControlState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_control(stream, accept_state.clone()));
            }
        });

        Self { address, state }
    }

    /// Address to hand to the control channel.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Port part of [`MockControlServer::address`].
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Every command received so far, without the trailing CRLF.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.commands).clone()
    }

    /// Commands starting with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close whichever connection sends the next command, without replying.
    pub fn close_on_next_command(&self) {
        self.state.close_next.store(true, Ordering::SeqCst);
    }
}

async fn serve_control(stream: TcpStream, state: Arc<ControlState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if state.close_next.swap(false, Ordering::SeqCst) {
            return;
        }

        let command = line.trim_end_matches(['\r', '\n']).to_string();
        lock(&state.commands).push(command.clone());

        let reply = if command.starts_with("PROTOCOLINFO") {
            fixtures::protocolinfo_response()
        } else if command == "GETINFO version" {
            fixtures::version_response()
        } else {
            fixtures::ok_response()
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
        if command == "QUIT" {
            return;
        }
    }
}

struct SocksState {
    requests: Mutex<Vec<Vec<u8>>>,
    reply_code: AtomicU8,
    json_body: Mutex<Option<String>>,
}

/// A fake SOCKS5 listener bound to an ephemeral local port.
pub struct MockSocksServer {
    address: SocketAddr,
    state: Arc<SocksState>,
}

impl MockSocksServer {
    /// Bind and start accepting connections in the background.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock socks port");
        let address = listener.local_addr().expect("mock socks address");
        let state = Arc::new(SocksState {
            requests: Mutex::new(Vec::new()),
            reply_code: AtomicU8::new(0x00),
            json_body: Mutex::new(None),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_socks(stream, accept_state.clone()));
            }
        });

        Self { address, state }
    }

    /// Address of the listener.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Port of the listener.
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Answer CONNECT requests with this REP code instead of success.
    pub fn refuse_with(&self, code: u8) {
        self.state.reply_code.store(code, Ordering::SeqCst);
    }

    /// After the handshake, answer one HTTP request with this JSON body.
    pub fn serve_json(&self, body: &str) {
        *lock(&self.state.json_body) = Some(body.to_string());
    }

    /// Raw CONNECT requests received so far.
    pub fn connect_requests(&self) -> Vec<Vec<u8>> {
        lock(&self.state.requests).clone()
    }
}

async fn serve_socks(mut stream: TcpStream, state: Arc<SocksState>) -> std::io::Result<()> {
    let mut greeting = [0u8; 3];
    stream.read_exact(&mut greeting).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let mut request = header.to_vec();
    let addr_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        _ => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            request.push(len[0]);
            len[0] as usize
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    request.extend_from_slice(&rest);
    lock(&state.requests).push(request);

    let code = state.reply_code.load(Ordering::SeqCst);
    stream
        .write_all(&[0x05, code, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
        .await?;
    if code != 0x00 {
        return Ok(());
    }

    let body = lock(&state.json_body).clone();
    match body {
        Some(body) => {
            let mut reader = BufReader::new(&mut stream);
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 || line == "\r\n" {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await
        }
        None => {
            let (mut r, mut w) = stream.split();
            tokio::io::copy(&mut r, &mut w).await.map(|_| ())
        }
    }
}
