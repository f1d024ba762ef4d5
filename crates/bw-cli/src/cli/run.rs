//! Run Command Implementation

use anyhow::{Context, Result};
use bw_core::{ClientConfig, brand};
use bw_daemon::Daemon;
use std::path::PathBuf;
use tracing::info;

/// Run the client until interrupted
pub async fn run(path: PathBuf) -> Result<()> {
    let config = ClientConfig::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(
        "Loaded {} proxies and {} visitors from {}",
        config.proxies.len(),
        config.visitors.len(),
        path.display()
    );

    let mut daemon = Daemon::new(config).await?;
    daemon.start().await?;

    println!();
    println!("{} is running", brand::PRODUCT_NAME);
    println!("  link: {}", daemon.link());
    let mut visitors: Vec<_> = daemon.visitor_addrs().iter().collect();
    visitors.sort();
    for (name, addr) in visitors {
        println!("  visitor {:<16} {}", name, addr);
    }
    println!();

    daemon.run().await?;

    let (proxies, visitors) = daemon.stats();
    info!(
        "Served {} proxy sessions ({} B in, {} B out) and {} visitor sessions",
        proxies.total_connections,
        proxies.bytes_received,
        proxies.bytes_sent,
        visitors.total_connections
    );
    Ok(())
}
