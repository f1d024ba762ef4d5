//! Burrow Daemon
//!
//! Background service that runs the P2P network, serves the exposed
//! proxies and carries visitor connections through their tunnels.

pub mod proxy;
pub mod server;
pub mod session;
pub mod visitor;

pub use proxy::{ProxyManager, ProxyRuntime};
pub use server::Daemon;
pub use session::{StatsSnapshot, TunnelStats};
pub use visitor::{TunnelDialer, TunnelTarget, VisitorManager, VisitorRuntime};
