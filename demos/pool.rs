//! Example: Proxy pool
//!
//! Starts a Tor instance with a handful of socks ports and prints each
//! endpoint's exit IP and latency as the health checks finish.
//!
//! Run with: cargo run --example pool

use std::time::Duration;
use tor_pool::{InstanceConfig, Result, TorInstance};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut tor = TorInstance::new(InstanceConfig::new().num_socks(5));
    println!("Starting Tor...");
    tor.start(None).await?;
    println!("Bootstrapped {}%\n", tor.bootstrap());

    if tor.bootstrap() < 100 {
        println!("Tor did not finish bootstrapping, giving up");
        tor.stop().await?;
        return Ok(());
    }

    // Endpoints are probed in the background; poll until they are measured
    for _ in 0..30 {
        let proxies = tor.proxies();
        if proxies.iter().all(|p| p.is_measured()) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    for proxy in tor.proxies() {
        match (proxy.public_ip(), proxy.latency()) {
            (Some(ip), Some(latency)) => {
                println!("{:<26} {:<16} {:?}", proxy.socks_url(), ip, latency)
            }
            _ => println!("{:<26} unmeasured", proxy.socks_url()),
        }
    }

    if let Some(fastest) = tor.pool().fastest() {
        println!("\nFastest: {}", fastest);
    }

    tor.stop().await?;
    println!("\nDone!");
    Ok(())
}
