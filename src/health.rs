//! Public-IP probing through proxy endpoints.
//!
//! A probe walks the provider list in order. Each attempt opens a tunnel,
//! sends a bare HTTP/1.0 GET and pulls one key out of the JSON body. The
//! first attempt that yields an address wins; if all fail, the probe
//! reports a single [`TorPoolError::LookupFailed`].

use crate::endpoint::ProxyEndpoint;
use crate::error::{Result, TorPoolError};
use crate::socks::SocksClient;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A byte stream through a proxy.
pub trait ProxyIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyIo for T {}

/// Boxed stream returned by a [`ConnectionOpener`].
pub type BoxedStream = Box<dyn ProxyIo>;

/// Boxed future used by [`ConnectionOpener`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens a tunnel to `host:port` through an endpoint.
pub trait ConnectionOpener: Send + Sync {
    /// Connect through `endpoint`.
    fn open<'a>(
        &'a self,
        endpoint: &'a ProxyEndpoint,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>>;
}

/// Opens tunnels with [`SocksClient`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SocksOpener;

impl ConnectionOpener for SocksOpener {
    fn open<'a>(
        &'a self,
        endpoint: &'a ProxyEndpoint,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = SocksClient::open(endpoint, host, port).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// A JSON service that echoes the caller's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpProvider {
    /// Host to connect to, also sent as `Host`.
    pub host: String,
    /// Port; 443 implies TLS.
    pub port: u16,
    /// Request path.
    pub path: String,
    /// JSON key holding the address.
    pub json_key: String,
}

impl IpProvider {
    /// Describe a provider.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        json_key: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            json_key: json_key.into(),
        }
    }

    /// httpbin, ipify and seeip, in that order.
    pub fn defaults() -> Vec<IpProvider> {
        vec![
            IpProvider::new("httpbin.org", 443, "/ip", "origin"),
            IpProvider::new("api.ipify.org", 443, "/?format=json", "ip"),
            IpProvider::new("ip.seeip.org", 443, "/json", "ip"),
        ]
    }

    fn request(&self) -> String {
        format!("GET {} HTTP/1.0\r\nHost: {}\r\n\r\n", self.path, self.host)
    }
}

/// Why one provider attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The attempt ran past its deadline.
    #[error("timed out")]
    Timeout,
    /// The tunnel could not be opened or broke mid-exchange.
    #[error("connection failed: {0}")]
    Connect(#[from] TorPoolError),
    /// Read or write on the open tunnel failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The body was not UTF-8.
    #[error("body is not UTF-8")]
    BadUtf8,
    /// The body was not JSON.
    #[error("bad JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    /// The JSON lacked the expected string key.
    #[error("missing key '{0}'")]
    MissingKey(String),
}

/// A successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Exit address reported by the provider.
    pub public_ip: String,
    /// Host of the provider that answered.
    pub provider: String,
    /// Time to open the tunnel.
    pub latency: Duration,
}

/// Measures endpoints against a list of providers.
#[derive(Clone)]
pub struct HealthChecker {
    providers: Vec<IpProvider>,
    opener: Arc<dyn ConnectionOpener>,
    timeout: Duration,
}

impl HealthChecker {
    /// Probe the default providers over SOCKS, `timeout` per attempt.
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: IpProvider::defaults(),
            opener: Arc::new(SocksOpener),
            timeout,
        }
    }

    /// Replace the provider list.
    pub fn with_providers(mut self, providers: Vec<IpProvider>) -> Self {
        self.providers = providers;
        self
    }

    /// Replace how tunnels are opened.
    pub fn with_opener(mut self, opener: Arc<dyn ConnectionOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Find `endpoint`'s public IP, trying each provider in turn.
    pub async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<ProbeOutcome> {
        for provider in &self.providers {
            match self.attempt(endpoint, provider).await {
                Ok(outcome) => {
                    debug!(
                        "{} exits via {} ({} in {:?})",
                        endpoint, outcome.public_ip, outcome.provider, outcome.latency
                    );
                    return Ok(outcome);
                }
                Err(e) => debug!("{} lookup via {} failed: {}", endpoint, provider.host, e),
            }
        }

        Err(TorPoolError::LookupFailed {
            endpoint: endpoint.socks_url(),
        })
    }

    async fn attempt(
        &self,
        endpoint: &ProxyEndpoint,
        provider: &IpProvider,
    ) -> std::result::Result<ProbeOutcome, AttemptError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let started = Instant::now();

        let mut stream = tokio::time::timeout_at(
            deadline,
            self.opener.open(endpoint, &provider.host, provider.port),
        )
        .await
        .map_err(|_| AttemptError::Timeout)??;
        let latency = started.elapsed();

        let result = match tokio::time::timeout_at(deadline, fetch_ip(&mut stream, provider)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Timeout),
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown of tunnel via {} failed: {}", endpoint, e),
            Err(_) => warn!("Shutdown of tunnel via {} timed out", endpoint),
        }

        result.map(|public_ip| ProbeOutcome {
            public_ip,
            provider: provider.host.clone(),
            latency,
        })
    }
}

async fn fetch_ip(
    stream: &mut BoxedStream,
    provider: &IpProvider,
) -> std::result::Result<String, AttemptError> {
    stream.write_all(provider.request().as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 || line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    let body = String::from_utf8(body).map_err(|_| AttemptError::BadUtf8)?;
    let json: serde_json::Value = serde_json::from_str(&body)?;

    json.get(&provider.json_key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AttemptError::MissingKey(provider.json_key.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves canned HTTP responses over in-memory pipes, keyed by host.
    struct CannedOpener {
        responses: Vec<(String, Option<String>)>,
        silent: Vec<String>,
        opened: Mutex<Vec<String>>,
    }

    impl CannedOpener {
        fn new(responses: Vec<(&str, Option<String>)>) -> Arc<Self> {
            Self::with_silent(responses, &[])
        }

        /// Tunnels to `silent` hosts open but never answer.
        fn with_silent(responses: Vec<(&str, Option<String>)>, silent: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: responses
                    .into_iter()
                    .map(|(h, r)| (h.to_string(), r))
                    .collect(),
                silent: silent.iter().map(|h| h.to_string()).collect(),
                opened: Mutex::new(Vec::new()),
            })
        }
    }

    impl ConnectionOpener for CannedOpener {
        fn open<'a>(
            &'a self,
            _endpoint: &'a ProxyEndpoint,
            host: &'a str,
            _port: u16,
        ) -> BoxFuture<'a, Result<BoxedStream>> {
            Box::pin(async move {
                self.opened.lock().unwrap().push(host.to_string());
                if self.silent.iter().any(|h| h == host) {
                    let (client, server) = tokio::io::duplex(64);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        drop(server);
                    });
                    return Ok(Box::new(client) as BoxedStream);
                }
                let response = self
                    .responses
                    .iter()
                    .find(|(h, _)| h == host)
                    .and_then(|(_, r)| r.clone())
                    .ok_or_else(|| TorPoolError::ConnectionFailed(host.to_string()))?;

                let (client, mut server) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(&mut server);
                    let mut line = String::new();
                    while reader.read_line(&mut line).await.unwrap_or(0) > 0 && line != "\r\n" {
                        line.clear();
                    }
                    let _ = server.write_all(response.as_bytes()).await;
                    let _ = server.shutdown().await;
                });
                Ok(Box::new(client) as BoxedStream)
            })
        }
    }

    fn providers() -> Vec<IpProvider> {
        vec![
            IpProvider::new("one.test", 443, "/ip", "origin"),
            IpProvider::new("two.test", 443, "/?format=json", "ip"),
            IpProvider::new("three.test", 443, "/json", "ip"),
        ]
    }

    fn http(body: &str) -> String {
        format!("HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{}", body)
    }

    #[tokio::test]
    async fn test_falls_through_to_third_provider() {
        let opener = CannedOpener::new(vec![
            ("one.test", None),
            ("two.test", Some(http("not json"))),
            ("three.test", Some(http(r#"{"ip": "1.2.3.4"}"#))),
        ]);
        let checker = HealthChecker::new(Duration::from_secs(2))
            .with_providers(providers())
            .with_opener(opener.clone());

        let outcome = checker.probe(&ProxyEndpoint::local(10080)).await.unwrap();
        assert_eq!(outcome.public_ip, "1.2.3.4");
        assert_eq!(outcome.provider, "three.test");
        assert_eq!(*opener.opened.lock().unwrap(), vec!["one.test", "two.test", "three.test"]);
    }

    #[tokio::test]
    async fn test_answers_after_two_silent_providers() {
        let opener = CannedOpener::with_silent(
            vec![("three.test", Some(http(r#"{"ip":"1.2.3.4"}"#)))],
            &["one.test", "two.test"],
        );
        let checker = HealthChecker::new(Duration::from_millis(100))
            .with_providers(providers())
            .with_opener(opener.clone());
        let endpoint = ProxyEndpoint::local(10080);

        let started = Instant::now();
        let outcome = checker.probe(&endpoint).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(outcome.public_ip, "1.2.3.4");
        assert_eq!(outcome.provider, "three.test");
        assert_eq!(*opener.opened.lock().unwrap(), vec!["one.test", "two.test", "three.test"]);
    }

    #[tokio::test]
    async fn test_first_answer_wins() {
        let opener = CannedOpener::new(vec![
            ("one.test", Some(http(r#"{"origin": "5.6.7.8"}"#))),
            ("two.test", Some(http(r#"{"ip": "1.2.3.4"}"#))),
        ]);
        let checker = HealthChecker::new(Duration::from_secs(2))
            .with_providers(providers())
            .with_opener(opener.clone());

        let outcome = checker.probe(&ProxyEndpoint::local(10080)).await.unwrap();
        assert_eq!(outcome.public_ip, "5.6.7.8");
        assert_eq!(opener.opened.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_one_error() {
        let opener = CannedOpener::new(vec![
            ("one.test", Some(http(r#"{"ip": "wrong key"}"#))),
            ("two.test", Some(http("\u{0}\u{1}"))),
        ]);
        let checker = HealthChecker::new(Duration::from_secs(2))
            .with_providers(providers())
            .with_opener(opener);

        let err = checker.probe(&ProxyEndpoint::local(10080)).await.unwrap_err();
        assert!(matches!(err, TorPoolError::LookupFailed { ref endpoint } if endpoint == "socks5://127.0.0.1:10080"));
    }

    struct StalledOpener;

    impl ConnectionOpener for StalledOpener {
        fn open<'a>(
            &'a self,
            _endpoint: &'a ProxyEndpoint,
            _host: &'a str,
            _port: u16,
        ) -> BoxFuture<'a, Result<BoxedStream>> {
            Box::pin(async move {
                // Peer that never answers.
                let (client, server) = tokio::io::duplex(64);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(server);
                });
                Ok(Box::new(client) as BoxedStream)
            })
        }
    }

    #[tokio::test]
    async fn test_silent_provider_times_out() {
        let checker = HealthChecker::new(Duration::from_millis(100))
            .with_providers(providers())
            .with_opener(Arc::new(StalledOpener));

        let started = Instant::now();
        let err = checker.probe(&ProxyEndpoint::local(10080)).await.unwrap_err();
        assert!(matches!(err, TorPoolError::LookupFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
