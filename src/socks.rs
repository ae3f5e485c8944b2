//! SOCKS5 client with in-place TLS upgrade.
//!
//! The handshake is written by hand: no-auth greeting, a CONNECT request
//! and a reply read to its exact length. Nothing past the reply is ever
//! buffered, so a TLS session can be started on the same socket without
//! losing or repeating bytes.

use crate::endpoint::{ProxyEndpoint, ProxyScheme};
use crate::error::{Result, TorPoolError};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Ports that are upgraded to TLS without an explicit config.
pub const TLS_PORTS: [u16; 2] = [443, 8443];

/// Destination of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Dotted-quad IPv4 literal.
    Ipv4(Ipv4Addr),
    /// Host name, resolved by the proxy.
    Domain(String),
}

impl TargetAddr {
    /// Classify a host. IPv6 literals and non-ASCII names are rejected;
    /// internationalized names must be punycode-encoded first.
    pub fn parse(host: &str) -> Result<Self> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(TargetAddr::Ipv4(ip));
        }
        let unbracketed = host.trim_start_matches('[').trim_end_matches(']');
        if unbracketed.parse::<Ipv6Addr>().is_ok() {
            return Err(TorPoolError::UnsupportedAddressType(host.to_string()));
        }
        if host.is_empty() || host.len() > 255 {
            return Err(TorPoolError::SocksHandshake(format!(
                "Host name must be 1-255 bytes, got {}",
                host.len()
            )));
        }
        if !host.is_ascii() {
            return Err(TorPoolError::UnsupportedAddressType(format!(
                "{} is not an ASCII host name",
                host
            )));
        }
        Ok(TargetAddr::Domain(host.to_string()))
    }

    /// ATYP byte plus address bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            TargetAddr::Ipv4(ip) => {
                let mut out = vec![ATYP_IPV4];
                out.extend_from_slice(&ip.octets());
                out
            }
            TargetAddr::Domain(name) => {
                let mut out = vec![ATYP_DOMAIN, name.len() as u8];
                out.extend_from_slice(name.as_bytes());
                out
            }
        }
    }

    fn server_name(&self) -> Result<ServerName<'static>> {
        match self {
            TargetAddr::Ipv4(ip) => Ok(ServerName::from(IpAddr::V4(*ip))),
            TargetAddr::Domain(name) => server_name(name),
        }
    }
}

fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| TorPoolError::Tls(format!("Invalid server name '{}': {}", name, e)))
}

/// Bytes of a CONNECT request for `target:port`.
pub fn connect_request(target: &TargetAddr, port: u16) -> Vec<u8> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    request.extend(target.encode());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

/// Run the client side of a no-auth SOCKS5 CONNECT over `stream`.
pub async fn handshake<S>(stream: &mut S, target: &TargetAddr, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, 0x01, NO_AUTH]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [SOCKS_VERSION, NO_AUTH] {
        return Err(TorPoolError::SocksHandshake(format!(
            "Unexpected method selection {:02x?}",
            method
        )));
    }

    let request = connect_request(target, port);
    trace!("SOCKS CONNECT {:02x?}", request);
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(TorPoolError::SocksHandshake(format!(
            "Bad reply version {:#04x}",
            header[0]
        )));
    }
    if header[1] != 0x00 {
        return Err(TorPoolError::SocksHandshake(format!(
            "Proxy replied {:#04x}: {}",
            header[1],
            reply_message(header[1])
        )));
    }

    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(TorPoolError::SocksHandshake(format!(
                "Bad bound address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Verifying client config backed by the webpki root set.
pub fn default_tls_config() -> Result<Arc<ClientConfig>> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TorPoolError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// An open tunnel, plain or TLS.
pub enum ProxyStream {
    /// Raw tunnel.
    Plain(TcpStream),
    /// Tunnel upgraded to TLS.
    Tls(Box<TlsStream<TcpStream>>),
}

impl ProxyStream {
    /// Whether the tunnel carries TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, ProxyStream::Tls(_))
    }
}

impl std::fmt::Debug for ProxyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (variant, stream) = match self {
            ProxyStream::Plain(s) => ("Plain", s),
            ProxyStream::Tls(s) => ("Tls", s.get_ref().0),
        };
        f.debug_struct("ProxyStream")
            .field("variant", &variant)
            .field("is_tls", &self.is_tls())
            .field("peer", &stream.peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens tunnels through proxy endpoints.
pub struct SocksClient;

impl SocksClient {
    /// Open a tunnel to `host:port` through `endpoint`.
    ///
    /// The tunnel is upgraded to TLS when `tls_config` is given or the port
    /// is one of [`TLS_PORTS`]. `tls_server_name` overrides the name used for
    /// SNI and certificate checks. The time from TCP connect to the end of
    /// the handshakes is stored as the endpoint's latency.
    pub async fn connect(
        endpoint: &ProxyEndpoint,
        host: &str,
        port: u16,
        tls_config: Option<Arc<ClientConfig>>,
        tls_server_name: Option<&str>,
    ) -> Result<ProxyStream> {
        if endpoint.scheme() != ProxyScheme::Socks5 {
            return Err(TorPoolError::SocksHandshake(format!(
                "{} is not a SOCKS5 endpoint",
                endpoint
            )));
        }
        let target = TargetAddr::parse(host)?;

        let started = Instant::now();
        let mut stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| TorPoolError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
        handshake(&mut stream, &target, port).await?;

        let upgrade = tls_config.is_some() || TLS_PORTS.contains(&port);
        let stream = if upgrade {
            let config = match tls_config {
                Some(config) => config,
                None => default_tls_config()?,
            };
            let name = match tls_server_name {
                Some(name) => server_name(name)?,
                None => target.server_name()?,
            };
            let tls = TlsConnector::from(config)
                .connect(name, stream)
                .await
                .map_err(|e| TorPoolError::Tls(format!("{}:{} via {}: {}", host, port, endpoint, e)))?;
            ProxyStream::Tls(Box::new(tls))
        } else {
            ProxyStream::Plain(stream)
        };

        let elapsed = started.elapsed();
        endpoint.set_latency(elapsed);
        debug!("Tunnel to {}:{} via {} in {:?}", host, port, endpoint, elapsed);
        Ok(stream)
    }

    /// Open a tunnel with default TLS behaviour.
    pub async fn open(endpoint: &ProxyEndpoint, host: &str, port: u16) -> Result<ProxyStream> {
        Self::connect(endpoint, host, port, None, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockSocksServer;

    #[test]
    fn test_ipv4_target_encoding() {
        let target = TargetAddr::parse("93.184.216.34").unwrap();
        assert_eq!(
            connect_request(&target, 443),
            vec![0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB]
        );
    }

    #[test]
    fn test_domain_target_encoding() {
        let target = TargetAddr::parse("example.com").unwrap();
        let request = connect_request(&target, 443);
        assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 0x0B]);
        assert_eq!(&request[5..16], b"example.com");
        assert_eq!(&request[16..], &[0x01, 0xBB]);
    }

    #[test]
    fn test_ipv6_target_rejected() {
        for host in ["::1", "[2001:db8::1]"] {
            assert!(matches!(
                TargetAddr::parse(host),
                Err(TorPoolError::UnsupportedAddressType(_))
            ));
        }
        assert!(TargetAddr::parse(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_non_ascii_host_rejected() {
        assert!(matches!(
            TargetAddr::parse("bücher.example"),
            Err(TorPoolError::UnsupportedAddressType(_))
        ));
        assert_eq!(
            TargetAddr::parse("xn--bcher-kva.example").unwrap(),
            TargetAddr::Domain("xn--bcher-kva.example".to_string())
        );
    }

    #[tokio::test]
    async fn test_plain_tunnel_preserves_bytes() {
        let server = MockSocksServer::start().await;
        let endpoint = ProxyEndpoint::local(server.port());

        let mut stream = SocksClient::open(&endpoint, "example.com", 80).await.unwrap();
        assert!(!stream.is_tls());
        let rendered = format!("{:?}", stream);
        assert!(rendered.contains("Plain") && rendered.contains("is_tls: false"));
        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        assert!(endpoint.latency().is_some());
        let requests = server.connect_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0][3], 0x03);
        assert_eq!(&requests[0][requests[0].len() - 2..], &[0x00, 0x50]);
    }

    #[tokio::test]
    async fn test_refused_connect_is_reported() {
        let server = MockSocksServer::start().await;
        server.refuse_with(0x05);
        let endpoint = ProxyEndpoint::local(server.port());

        let err = SocksClient::open(&endpoint, "10.1.2.3", 80).await.unwrap_err();
        match err {
            TorPoolError::SocksHandshake(msg) => assert!(msg.contains("connection refused")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_reads_domain_reply_exactly() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let target = TargetAddr::parse("example.com").unwrap();

        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 3];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = vec![0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut request).await.unwrap();
            // Bound address as a 4-byte name, then application data.
            server
                .write_all(&[0x05, 0x00, 0x00, 0x03, 4, b'h', b'o', b's', b't', 0x00, 0x50])
                .await
                .unwrap();
            server.write_all(b"DATA").await.unwrap();
        });

        handshake(&mut client, &target, 80).await.unwrap();
        let mut rest = [0u8; 4];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"DATA");
        peer.await.unwrap();
    }

    #[test]
    fn test_default_tls_config_builds() {
        let config = default_tls_config().unwrap();
        assert!(Arc::ptr_eq(&config, &default_tls_config().unwrap()));
    }
}
