//! Visitor Runtime
//!
//! Binds a local listener per visitor and carries every accepted connection
//! to the remote proxy. Which tunnel a connection rides on is decided by the
//! visitor's [`FallbackController`].

use bw_core::proxy::BoxedIo;
use bw_core::visitor::Establish;
use bw_core::{
    BufferPool, BurrowError, FallbackController, NetworkHandle, PeerId, Result, Selected,
    TunnelRequest, TunnelResponse, VisitorConfig, VisitorKind, VisitorState, read_frame,
    write_frame,
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::{self, TunnelStats};

/// How long a relayed connection may take to come up
const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to peers and opens tunnel streams
pub trait TunnelDialer: Send + Sync + 'static {
    /// Make sure a connection of the requested kind to `peer_id` exists
    fn connect(&self, peer_id: PeerId, direct: bool) -> BoxFuture<'static, Result<()>>;

    /// Open a fresh tunnel stream to `peer_id`
    fn open_stream(&self, peer_id: PeerId) -> BoxFuture<'static, Result<BoxedIo>>;
}

impl TunnelDialer for NetworkHandle {
    fn connect(&self, peer_id: PeerId, direct: bool) -> BoxFuture<'static, Result<()>> {
        let network = self.clone();
        Box::pin(async move {
            if direct {
                network.wait_direct(peer_id).await
            } else {
                network.ensure_connected(peer_id, RELAY_CONNECT_TIMEOUT).await
            }
        })
    }

    fn open_stream(&self, peer_id: PeerId) -> BoxFuture<'static, Result<BoxedIo>> {
        let network = self.clone();
        Box::pin(async move {
            let stream = network.open_stream(peer_id).await?;
            Ok(Box::new(stream.compat()) as BoxedIo)
        })
    }
}

/// Where a tunnel leads: the peer and the proxy on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub peer_id: PeerId,
    pub proxy_name: String,
    pub secret_key: String,
    pub direct: bool,
}

impl TunnelTarget {
    pub fn from_config(config: &VisitorConfig) -> Result<Self> {
        Ok(Self {
            peer_id: config.server_peer_id()?,
            proxy_name: config.server_name.clone(),
            secret_key: config.secret_key.clone(),
            direct: config.kind == VisitorKind::Xtcp,
        })
    }
}

fn establish(target: TunnelTarget, dialer: Arc<dyn TunnelDialer>) -> impl Establish<TunnelTarget> {
    move || {
        let target = target.clone();
        let connect = dialer.connect(target.peer_id, target.direct);
        async move {
            connect.await?;
            Ok::<_, BurrowError>(target)
        }
    }
}

/// One configured visitor
pub struct VisitorRuntime {
    config: VisitorConfig,
    controller: FallbackController<TunnelTarget>,
}

impl VisitorRuntime {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> VisitorState {
        self.controller.state()
    }

    /// Carry one accepted local connection to the remote proxy
    async fn serve_connection(
        &self,
        local: TcpStream,
        peer_addr: SocketAddr,
        dialer: &dyn TunnelDialer,
        pool: &BufferPool,
        stats: &Arc<TunnelStats>,
    ) -> Result<()> {
        let Selected { route, tunnel } = self.controller.acquire().await?;
        debug!(
            "[{}] connection from {} uses the {} tunnel",
            self.config.name, peer_addr, route
        );

        let request = TunnelRequest::new(&tunnel.proxy_name, &tunnel.secret_key)
            .with_addrs(Some(peer_addr), local.local_addr().ok());

        let stream = match open_tunnel(dialer, &tunnel, &request).await {
            Ok(stream) => stream,
            Err(e) => {
                if !matches!(e, BurrowError::Rejected(_)) {
                    self.controller.report_broken(route);
                }
                return Err(e);
            }
        };

        session::pump(local, stream, pool, stats).await
    }
}

async fn open_tunnel(
    dialer: &dyn TunnelDialer,
    tunnel: &TunnelTarget,
    request: &TunnelRequest,
) -> Result<BoxedIo> {
    let mut stream = dialer.open_stream(tunnel.peer_id).await?;
    write_frame(&mut stream, request).await?;
    let response: TunnelResponse = read_frame(&mut stream).await?;
    response.into_result()?;
    Ok(stream)
}

/// All visitors of this client
pub struct VisitorManager {
    runtimes: HashMap<String, Arc<VisitorRuntime>>,
    dialer: Arc<dyn TunnelDialer>,
    pool: BufferPool,
    stats: Arc<TunnelStats>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VisitorManager {
    /// Build a runtime per visitor. Visitors whose configuration cannot be
    /// resolved are logged and left out.
    pub fn new(configs: &[VisitorConfig], dialer: Arc<dyn TunnelDialer>, pool: BufferPool) -> Self {
        let mut runtimes = HashMap::new();
        for config in configs {
            match Self::build(config, configs, &dialer) {
                Ok(runtime) => {
                    runtimes.insert(config.name.clone(), Arc::new(runtime));
                }
                Err(e) => error!("Visitor {} disabled: {}", config.name, e),
            }
        }

        Self {
            runtimes,
            dialer,
            pool,
            stats: TunnelStats::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn build(
        config: &VisitorConfig,
        siblings: &[VisitorConfig],
        dialer: &Arc<dyn TunnelDialer>,
    ) -> Result<VisitorRuntime> {
        config.validate(siblings)?;
        let primary = establish(TunnelTarget::from_config(config)?, Arc::clone(dialer));
        let mut controller = FallbackController::new(&config.name, primary, config.fallback_policy());

        if let Some(fallback_name) = &config.fallback_to {
            let fallback = siblings.iter().find(|c| &c.name == fallback_name).ok_or_else(|| {
                BurrowError::ConfigError(format!("unknown fallback visitor {}", fallback_name))
            })?;
            let target = TunnelTarget::from_config(fallback)?;
            controller = controller.with_fallback(establish(target, Arc::clone(dialer)));
            info!(
                "[{}] falls back to {} after {}ms",
                config.name, fallback_name, config.fallback_timeout_ms
            );
        }

        Ok(VisitorRuntime {
            config: config.clone(),
            controller,
        })
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<VisitorRuntime>> {
        self.runtimes.get(name)
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    /// Bind local listeners. Returns the bound address per visitor;
    /// visitors with a negative `bind_port` get none.
    pub async fn start(&self) -> HashMap<String, SocketAddr> {
        let mut bound = HashMap::new();

        for (name, runtime) in &self.runtimes {
            let addr = match runtime.config.bind_socket() {
                Ok(Some(addr)) => addr,
                Ok(None) => {
                    debug!("[{}] no local listener", name);
                    continue;
                }
                Err(e) => {
                    error!("[{}] {}", name, e);
                    continue;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("[{}] failed to bind {}: {}", name, addr, e);
                    continue;
                }
            };
            let local_addr = listener.local_addr().unwrap_or(addr);
            info!("[{}] {} visitor listening on {}", name, runtime.config.kind, local_addr);
            bound.insert(name.clone(), local_addr);

            let task = tokio::spawn(accept_loop(
                listener,
                Arc::clone(runtime),
                Arc::clone(&self.dialer),
                self.pool.clone(),
                Arc::clone(&self.stats),
                self.shutdown.clone(),
            ));
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
        }

        bound
    }

    /// Stop listeners and close every controller
    pub async fn close(&self) {
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Visitor task failed: {}", e);
            }
        }
        for runtime in self.runtimes.values() {
            runtime.controller.close().await;
        }
        info!("Visitors closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    runtime: Arc<VisitorRuntime>,
    dialer: Arc<dyn TunnelDialer>,
    pool: BufferPool,
    stats: Arc<TunnelStats>,
    shutdown: CancellationToken,
) {
    loop {
        let (socket, peer_addr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[{}] accept failed: {}", runtime.name(), e);
                    continue;
                }
            },
        };

        let runtime = Arc::clone(&runtime);
        let dialer = Arc::clone(&dialer);
        let pool = pool.clone();
        let stats = Arc::clone(&stats);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let session = runtime.serve_connection(socket, peer_addr, dialer.as_ref(), &pool, &stats);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = session => {
                    if let Err(e) = result {
                        warn!("[{}] connection from {} failed: {}", runtime.name(), peer_addr, e);
                    }
                }
            }
        });
    }
    debug!("[{}] listener stopped", runtime.name());
}

