//! Daemon Server
//!
//! Main daemon that orchestrates the P2P network, the exposed proxies and
//! the local visitors.

use bw_core::{
    BufferPool, BurrowError, ClientConfig, NetworkHandle, PeerId, PeerIdentity, PeerNetwork, PluginRegistry,
    Result, brand,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::proxy::ProxyManager;
use crate::session::StatsSnapshot;
use crate::visitor::VisitorManager;

/// Main daemon server
pub struct Daemon {
    config: ClientConfig,

    /// Network before `start()`
    network: Option<PeerNetwork>,

    /// Running network
    handle: Option<NetworkHandle>,

    peer_id: PeerId,
    link: String,

    proxies: Option<Arc<ProxyManager>>,
    visitors: Option<Arc<VisitorManager>>,
    proxy_task: Option<JoinHandle<()>>,

    /// Local listener per visitor, filled by `start()`
    bound: HashMap<String, SocketAddr>,

    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a new daemon. Only document-level problems fail here; a broken
    /// proxy or visitor is left out when the daemon starts.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let network = PeerNetwork::new(&config).await?;
        Ok(Self::from_network(config, network))
    }

    /// Create a daemon with an explicit identity
    pub fn with_identity(config: ClientConfig, identity: PeerIdentity) -> Result<Self> {
        config.validate()?;
        let network = PeerNetwork::with_identity(identity, &config)?;
        Ok(Self::from_network(config, network))
    }

    fn from_network(config: ClientConfig, network: PeerNetwork) -> Self {
        let peer_id = *network.peer_id();
        let link = network.link();

        Self {
            config,
            network: Some(network),
            handle: None,
            peer_id,
            link,
            proxies: None,
            visitors: None,
            proxy_task: None,
            bound: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Get our `burrow://` link
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Token that stops `run()` when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Local listen address of each visitor
    pub fn visitor_addrs(&self) -> &HashMap<String, SocketAddr> {
        &self.bound
    }

    /// Start the network, the proxies and the visitors
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting {} daemon...", brand::PRODUCT_NAME);

        let Some(network) = self.network.take() else {
            warn!("Daemon already started");
            return Ok(());
        };
        let handle = network.spawn()?;

        let registry = PluginRegistry::builtin()?;
        let mut proxies = ProxyManager::new(&self.config.proxies, &registry, BufferPool::default());
        proxies.start();
        let proxies = Arc::new(proxies);

        if !self.config.proxies.is_empty() {
            let manager = Arc::clone(&proxies);
            let network = handle.clone();
            let shutdown = self.shutdown.child_token();
            self.proxy_task = Some(tokio::spawn(async move {
                if let Err(e) = manager.serve(network, shutdown).await {
                    error!("Proxy stream loop failed: {}", e);
                }
            }));
        }

        let visitors = Arc::new(VisitorManager::new(
            &self.config.visitors,
            Arc::new(handle.clone()),
            BufferPool::default(),
        ));
        let configured = self.config.proxies.len() + self.config.visitors.len();
        if configured > 0 && proxies.is_empty() && visitors.is_empty() {
            visitors.close().await;
            if let Some(task) = self.proxy_task.take() {
                task.abort();
            }
            handle.shutdown().await;
            return Err(BurrowError::ConfigError(format!(
                "none of the {} configured proxies and visitors could be started",
                configured
            )));
        }
        self.bound = visitors.start().await;

        info!("{} ready: {}", brand::PRODUCT_NAME, self.link);
        self.handle = Some(handle);
        self.proxies = Some(proxies);
        self.visitors = Some(visitors);
        Ok(())
    }

    /// Run until ctrl-c or the shutdown token fires, then stop everything
    pub async fn run(&mut self) -> Result<()> {
        if self.handle.is_none() {
            self.start().await?;
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                info!("Interrupted");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Close visitors and plugins, then stop the network
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();

        if let Some(visitors) = self.visitors.take() {
            visitors.close().await;
        }
        if let Some(task) = self.proxy_task.take() {
            if let Err(e) = task.await {
                error!("Proxy task failed: {}", e);
            }
        }
        if let Some(proxies) = self.proxies.take() {
            proxies.close().await;
        }
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
        info!("{} daemon stopped", brand::PRODUCT_NAME);
    }

    /// Session counters of proxies and visitors
    pub fn stats(&self) -> (StatsSnapshot, StatsSnapshot) {
        let proxies = self
            .proxies
            .as_ref()
            .map(|p| p.stats().snapshot())
            .unwrap_or_default();
        let visitors = self
            .visitors
            .as_ref()
            .map(|v| v.stats().snapshot())
            .unwrap_or_default();
        (proxies, visitors)
    }
}
