//! Example: New identity (circuit rotation)
//!
//! Starts Tor, waits for the first endpoint's exit IP, requests a new
//! identity and shows the exit IP measured afterwards.
//!
//! Run with: cargo run --example new_identity

use std::time::Duration;
use tor_pool::{InstanceConfig, ProxyEndpoint, Result, TorInstance};

async fn measured(tor: &TorInstance) -> Option<ProxyEndpoint> {
    for _ in 0..30 {
        if let Some(proxy) = tor.proxies().into_iter().find(|p| p.is_measured()) {
            return Some(proxy);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut tor = TorInstance::new(InstanceConfig::new().num_socks(1));
    tor.start(None).await?;
    println!("Bootstrapped {}%", tor.bootstrap());

    if let Some(proxy) = measured(&tor).await {
        println!("Exit before: {:?}", proxy.public_ip());
    }

    // Tor rate-limits NEWNYM; a request inside the window returns false
    println!("\nRequesting new identity (NEWNYM signal)...");
    if !tor.request_new_identity().await? {
        println!("Rate limited, retry in {:?}", tor.control().newnym_wait());
    }

    if let Some(proxy) = measured(&tor).await {
        println!("Exit after: {:?}", proxy.public_ip());
    }

    tor.stop().await?;
    println!("\nDone!");
    Ok(())
}
