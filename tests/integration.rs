//! Integration tests for tor-pool against local fakes.
//!
//! No Tor binary or network access is needed: a small SOCKS5 server on a
//! loopback port stands in for Tor's socks listener and answers every
//! tunnelled request with a canned public-IP document.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tor_pool::{
    ConfigKey, ConfigValue, HealthChecker, InstanceId, InstanceRegistry, IpProvider,
    ProxyEndpoint, ProxyPool, TargetAddr, TorPoolError, TorRc,
};

/// Default timeout for operations
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback SOCKS5 proxy that serves `body` as JSON on every tunnel.
/// Returns its port and a counter of accepted tunnels.
async fn fake_exit(body: &'static str) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tunnels = Arc::new(AtomicUsize::new(0));
    let counter = tunnels.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut greeting = [0u8; 3];
                socket.read_exact(&mut greeting).await.unwrap();
                socket.write_all(&[0x05, 0x00]).await.unwrap();

                let mut header = [0u8; 4];
                socket.read_exact(&mut header).await.unwrap();
                let addr_len = match header[3] {
                    0x01 => 4,
                    0x03 => socket.read_u8().await.unwrap() as usize,
                    other => panic!("unexpected ATYP {}", other),
                };
                let mut rest = vec![0u8; addr_len + 2];
                socket.read_exact(&mut rest).await.unwrap();
                socket
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();

                let mut reader = BufReader::new(socket);
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap() == 0 || line == "\r\n" {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{}",
                    body
                );
                let mut socket = reader.into_inner();
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        }
    });

    (port, tunnels)
}

fn plain_provider(host: &str, key: &str) -> IpProvider {
    IpProvider::new(host, 80, "/ip", key)
}

// ============================================================================
// Health Checks
// ============================================================================

mod health {
    use super::*;

    #[tokio::test]
    async fn test_probe_through_socks_tunnel() {
        let (port, _) = fake_exit(r#"{"origin": "203.0.113.7"}"#).await;
        let endpoint = ProxyEndpoint::local(port);
        let checker = HealthChecker::new(Duration::from_secs(2))
            .with_providers(vec![plain_provider("ip.example", "origin")]);

        let outcome = timeout(TEST_TIMEOUT, checker.probe(&endpoint))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.public_ip, "203.0.113.7");
        assert_eq!(outcome.provider, "ip.example");
        assert!(endpoint.latency().is_some());
    }

    #[tokio::test]
    async fn test_probe_falls_through_missing_key() {
        let (port, tunnels) = fake_exit(r#"{"ip": "198.51.100.4"}"#).await;
        let endpoint = ProxyEndpoint::local(port);
        let checker = HealthChecker::new(Duration::from_secs(2)).with_providers(vec![
            plain_provider("first.example", "origin"),
            plain_provider("second.example", "ip"),
        ]);

        let outcome = checker.probe(&endpoint).await.unwrap();
        assert_eq!(outcome.public_ip, "198.51.100.4");
        assert_eq!(outcome.provider, "second.example");
        assert_eq!(tunnels.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_probe_exhaustion_is_lookup_failure() {
        let (port, _) = fake_exit("not json").await;
        let endpoint = ProxyEndpoint::local(port);
        let checker = HealthChecker::new(Duration::from_secs(2))
            .with_providers(vec![plain_provider("only.example", "ip")]);

        let result = checker.probe(&endpoint).await;
        assert!(matches!(result, Err(TorPoolError::LookupFailed { .. })));
    }
}

// ============================================================================
// Proxy Pool
// ============================================================================

mod pool {
    use super::*;

    #[tokio::test]
    async fn test_pool_measures_and_keeps_results() {
        let (port, tunnels) = fake_exit(r#"{"ip": "192.0.2.10"}"#).await;
        let checker = HealthChecker::new(Duration::from_secs(2))
            .with_providers(vec![plain_provider("ip.example", "ip")]);
        let pool = ProxyPool::new(checker, Duration::from_millis(50));
        let config = TorRc::with_socks_ports(vec![port], std::env::temp_dir());

        let endpoints = pool.refresh(&config);
        assert_eq!(endpoints.len(), 1);

        let endpoint = endpoints[0].clone();
        timeout(TEST_TIMEOUT, async {
            while !endpoint.is_measured() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(endpoint.public_ip().as_deref(), Some("192.0.2.10"));
        assert_eq!(endpoint.provider().as_deref(), Some("ip.example"));

        let again = pool.refresh(&config);
        assert!(again[0].is_measured());
        assert_eq!(pool.probes_in_flight(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tunnels.load(Ordering::SeqCst), 1);
        assert_eq!(pool.fastest().map(|e| e.port()), Some(port));
    }
}

// ============================================================================
// Ports And Config
// ============================================================================

mod ports {
    use super::*;

    #[test]
    fn test_registered_ranges_do_not_overlap() {
        let registry = InstanceRegistry::new();
        let ids: Vec<InstanceId> = (0..4).map(|_| InstanceId::next()).collect();
        for id in &ids {
            registry.allocate(*id, 0).unwrap();
        }

        let mut seen = HashSet::new();
        for id in &ids {
            for port in registry.ports_of(*id).unwrap() {
                assert!(seen.insert(port), "port {} claimed twice", port);
            }
        }

        let mut bases: Vec<u16> = ids
            .iter()
            .map(|id| registry.ports_of(*id).unwrap()[0])
            .collect();
        bases.sort_unstable();
        assert!(bases.windows(2).all(|w| w[1] - w[0] >= 100));
    }

    #[test]
    fn test_torrc_renders_flags_and_notifies() {
        let mut config = TorRc::with_socks_ports(vec![9050, 9052], "/var/lib/tor-pool");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        config.subscribe(Arc::new(move |key: &ConfigKey, value: &ConfigValue| {
            sink.lock().unwrap().push((key.keyword(), value.to_list()));
        }));

        config.set_new_circuit_period(30);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("NewCircuitPeriod".to_string(), vec!["30".to_string()])]
        );

        let flags = config.as_cmdline();
        assert_eq!(&flags[..4], &["--SocksPort", "9050", "--SocksPort", "9052"]);
        assert!(flags.windows(2).any(|w| w == ["--ControlPort", "9051"]));
        assert!(flags.windows(2).any(|w| w == ["--NewCircuitPeriod", "30"]));
        assert!(config.as_string().contains("DataDirectory /var/lib/tor-pool\n"));
    }

    #[test]
    fn test_ipv6_targets_are_rejected() {
        assert!(matches!(
            TargetAddr::parse("2001:db8::1"),
            Err(TorPoolError::UnsupportedAddressType(_))
        ));
    }
}
