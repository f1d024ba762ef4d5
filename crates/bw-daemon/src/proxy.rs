//! Proxy Runtime
//!
//! Serves incoming tunnel streams for the proxies this client exposes.
//! Each stream names its proxy in the [`TunnelRequest`] header; the stream
//! is then handed to the proxy's plugin or bridged to its local port.

use bw_core::plugin::ClientPlugin;
use bw_core::proxy::TunnelIo;
use bw_core::{
    BufferPool, BurrowError, ConnectionEnvelope, ExtraInfo, NetworkHandle, PeerId, PluginRegistry,
    ProxyConfig, Result, TransportMeta, TunnelRequest, TunnelResponse, read_frame, write_frame,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::{self, TunnelStats};

/// Limit for receiving the tunnel header
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where accepted sessions of a proxy go
enum ProxyTarget {
    Plugin(Box<dyn ClientPlugin>),
    Local(String),
}

/// One configured proxy, ready to take sessions
pub struct ProxyRuntime {
    config: ProxyConfig,
    target: ProxyTarget,
}

impl ProxyRuntime {
    /// Build the runtime; plugins are created but not started
    pub fn new(config: ProxyConfig, registry: &PluginRegistry) -> Result<Self> {
        let target = match (&config.plugin, config.local_target()) {
            (Some(options), _) => ProxyTarget::Plugin(registry.create(options)?),
            (None, Some(addr)) => ProxyTarget::Local(addr),
            (None, None) => {
                return Err(BurrowError::ConfigError(format!(
                    "proxy {}: needs local_port or a plugin",
                    config.name
                )));
            }
        };
        Ok(Self { config, target })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn plugin_name(&self) -> Option<&'static str> {
        match &self.target {
            ProxyTarget::Plugin(plugin) => Some(plugin.name()),
            ProxyTarget::Local(_) => None,
        }
    }

    fn start(&self) -> Result<()> {
        if let ProxyTarget::Plugin(plugin) = &self.target {
            plugin.start()?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let ProxyTarget::Plugin(plugin) = &self.target {
            plugin.close().await;
        }
    }

    fn authorize(&self, request: &TunnelRequest) -> std::result::Result<(), String> {
        if self.config.kind.requires_secret() && request.secret_key != self.config.secret_key {
            return Err("secret key mismatch".to_string());
        }
        Ok(())
    }
}

/// All proxies of this client
pub struct ProxyManager {
    proxies: HashMap<String, ProxyRuntime>,
    pool: BufferPool,
    stats: Arc<TunnelStats>,
}

impl ProxyManager {
    /// Build every proxy. A proxy that cannot be built is logged and left
    /// out; the others still run.
    pub fn new(configs: &[ProxyConfig], registry: &PluginRegistry, pool: BufferPool) -> Self {
        let mut proxies = HashMap::new();
        for config in configs {
            match ProxyRuntime::new(config.clone(), registry) {
                Ok(runtime) => {
                    proxies.insert(config.name.clone(), runtime);
                }
                Err(e) => error!("Proxy {} disabled: {}", config.name, e),
            }
        }

        Self {
            proxies,
            pool,
            stats: TunnelStats::new(),
        }
    }

    /// Start plugin servers. Proxies whose plugin fails to start are dropped.
    pub fn start(&mut self) {
        self.proxies.retain(|name, runtime| match runtime.start() {
            Ok(()) => {
                info!("Proxy {} ready", name);
                true
            }
            Err(e) => {
                error!("Proxy {} failed to start: {}", name, e);
                false
            }
        });
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.proxies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn get(&self, name: &str) -> Option<&ProxyRuntime> {
        self.proxies.get(name)
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    /// Accept tunnel streams until `shutdown` fires
    pub async fn serve(self: Arc<Self>, network: NetworkHandle, shutdown: CancellationToken) -> Result<()> {
        let mut incoming = network.accept_streams()?;
        info!("Serving {} proxy(ies)", self.proxies.len());

        loop {
            let (peer_id, stream) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = incoming.next() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let relayed = !network.is_directly_connected(&peer_id).await;
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = manager.handle_stream(peer_id, relayed, stream.compat()).await {
                    debug!("Tunnel stream from {} ended: {}", peer_id, e);
                }
            });
        }

        debug!("Proxy stream loop stopped");
        Ok(())
    }

    /// Run the header exchange on one tunnel stream and dispatch it
    pub async fn handle_stream<S: TunnelIo>(&self, peer_id: PeerId, relayed: bool, mut stream: S) -> Result<()> {
        let request: TunnelRequest = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| BurrowError::StreamError("tunnel header timeout".to_string()))??;

        let Some(proxy) = self.proxies.get(&request.proxy_name) else {
            warn!("Peer {} asked for unknown proxy {}", peer_id, request.proxy_name);
            write_frame(&mut stream, &TunnelResponse::rejected("unknown proxy")).await?;
            return Err(BurrowError::Rejected(format!("unknown proxy {}", request.proxy_name)));
        };

        if let Err(reason) = proxy.authorize(&request) {
            warn!("Rejected peer {} for proxy {}: {}", peer_id, proxy.name(), reason);
            write_frame(&mut stream, &TunnelResponse::rejected(reason.as_str())).await?;
            return Err(BurrowError::Rejected(reason));
        }
        write_frame(&mut stream, &TunnelResponse::accepted()).await?;

        let mut extra = ExtraInfo::new()
            .with_attribute("proxy", proxy.name())
            .with_attribute("peer", peer_id.to_string());
        extra.src_addr = request.src_addr;
        extra.dst_addr = request.dst_addr;

        debug!(
            "Session for proxy {} from {} ({:?})",
            proxy.name(),
            peer_id,
            request.src_addr
        );

        match &proxy.target {
            ProxyTarget::Plugin(plugin) => {
                let transport = TransportMeta {
                    peer: Some(peer_id.to_string()),
                    relayed,
                    ..TransportMeta::default()
                };
                let envelope = ConnectionEnvelope::new(stream, Some(transport), &extra);
                if let Err(e) = plugin.handle(envelope, &extra) {
                    // The envelope was consumed; the session is gone.
                    warn!("Proxy {} dropped a session: {}", proxy.name(), e);
                    return Err(e);
                }
                Ok(())
            }
            ProxyTarget::Local(addr) => {
                let local = TcpStream::connect(addr.as_str()).await.map_err(|e| {
                    warn!("Proxy {} cannot reach {}: {}", proxy.name(), addr, e);
                    BurrowError::UpstreamUnavailable {
                        addr: addr.clone(),
                        reason: e.to_string(),
                    }
                })?;
                session::pump(local, stream, &self.pool, &self.stats).await
            }
        }
    }

    /// Close every plugin
    pub async fn close(&self) {
        for runtime in self.proxies.values() {
            runtime.close().await;
        }
        self.pool.close();
        info!("Proxies closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bw_core::ProxyKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn peer() -> PeerId {
        *bw_core::PeerIdentity::generate().peer_id()
    }

    fn local_proxy(name: &str, kind: ProxyKind, port: u16) -> ProxyConfig {
        ProxyConfig {
            name: name.to_string(),
            kind,
            local_ip: "127.0.0.1".to_string(),
            local_port: Some(port),
            secret_key: "abc".to_string(),
            plugin: None,
        }
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    fn manager(configs: &[ProxyConfig]) -> Arc<ProxyManager> {
        let registry = PluginRegistry::builtin().unwrap();
        Arc::new(ProxyManager::new(configs, &registry, BufferPool::default()))
    }

    #[tokio::test]
    async fn test_local_proxy_session() {
        let port = echo_server().await;
        let manager = manager(&[local_proxy("echo", ProxyKind::Stcp, port)]);

        let (mut visitor, proxy_side) = tokio::io::duplex(4096);
        let session = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.handle_stream(peer(), true, proxy_side).await })
        };

        write_frame(&mut visitor, &TunnelRequest::new("echo", "abc")).await.unwrap();
        let response: TunnelResponse = read_frame(&mut visitor).await.unwrap();
        assert!(response.accepted);

        visitor.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        visitor.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(visitor);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let manager = manager(&[local_proxy("echo", ProxyKind::Stcp, 9)]);

        let (mut visitor, proxy_side) = tokio::io::duplex(4096);
        let session = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.handle_stream(peer(), true, proxy_side).await }
        });

        write_frame(&mut visitor, &TunnelRequest::new("echo", "wrong")).await.unwrap();
        let response: TunnelResponse = read_frame(&mut visitor).await.unwrap();
        assert!(!response.accepted);
        assert!(matches!(session.await.unwrap(), Err(BurrowError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_tcp_proxy_needs_no_secret() {
        let port = echo_server().await;
        let manager = manager(&[local_proxy("open", ProxyKind::Tcp, port)]);

        let (mut visitor, proxy_side) = tokio::io::duplex(4096);
        tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.handle_stream(peer(), false, proxy_side).await }
        });

        write_frame(&mut visitor, &TunnelRequest::new("open", "")).await.unwrap();
        let response: TunnelResponse = read_frame(&mut visitor).await.unwrap();
        assert!(response.accepted);
    }

    #[tokio::test]
    async fn test_unknown_proxy() {
        let manager = manager(&[]);

        let (mut visitor, proxy_side) = tokio::io::duplex(4096);
        tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.handle_stream(peer(), true, proxy_side).await }
        });

        write_frame(&mut visitor, &TunnelRequest::new("nope", "abc")).await.unwrap();
        let response: TunnelResponse = read_frame(&mut visitor).await.unwrap();
        assert!(response.into_result().is_err());
    }

    #[tokio::test]
    async fn test_bad_plugin_disables_only_its_proxy() {
        let mut broken = local_proxy("broken", ProxyKind::Stcp, 9);
        broken.plugin = Some(bw_core::PluginOptions::Https2Http(
            bw_core::plugin::Https2HttpOptions::new("127.0.0.1:8080")
                .with_certificate("/nonexistent/a.crt", "/nonexistent/a.key"),
        ));
        let healthy = local_proxy("healthy", ProxyKind::Stcp, 9);

        let mut manager = ProxyManager::new(&[broken, healthy], &PluginRegistry::builtin().unwrap(), BufferPool::default());
        manager.start();

        assert_eq!(manager.names(), vec!["healthy"]);
        assert_eq!(manager.len(), 1);
        manager.close().await;
    }
}
