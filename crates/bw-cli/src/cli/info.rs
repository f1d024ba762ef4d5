//! Info Command Implementation

use anyhow::Result;
use bw_core::{ClientConfig, PeerIdentity, brand};
use std::path::PathBuf;

/// Run the info command
pub async fn run(config: Option<PathBuf>) -> Result<()> {
    let config = match config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    let identity_path = config.resolved_identity_path();
    let identity = PeerIdentity::load_or_generate(&identity_path)?;

    println!();
    println!("{} {}", brand::PRODUCT_NAME, env!("CARGO_PKG_VERSION"));
    println!("  Peer ID:       {}", identity.peer_id());
    println!("  Link:          {}", identity.to_link());
    println!("  Identity path: {}", identity_path.display());
    println!("  Config path:   {}", ClientConfig::default_config_path().display());
    println!();

    Ok(())
}
