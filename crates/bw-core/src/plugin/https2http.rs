//! HTTPS-to-HTTP Plugin
//!
//! Terminates TLS on tunneled connections and reverse-proxies the decrypted
//! requests to a plain HTTP service on the local machine.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{self, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ClientPlugin, PLUGIN_HTTPS2HTTP, PluginOptions, tls};
use crate::error::{BurrowError, Result};
use crate::proxy::{
    BackpressurePolicy, BridgeListener, ConnectionEnvelope, DEFAULT_BUFFER_SIZE,
    DEFAULT_QUEUE_CAPACITY, ExtraInfo, MIN_BUFFER_SIZE,
};

/// How long `close()` waits for the server task before aborting it
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout towards the local service
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only make sense for a single hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn default_read_header_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    256
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Header operations applied to every forwarded request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestHeaders {
    /// Headers set on the outbound request, replacing any inbound value
    #[serde(default)]
    pub set: BTreeMap<String, String>,
}

/// Options of the `https2http` plugin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Https2HttpOptions {
    /// Address of the local HTTP service (`host:port`)
    pub local_addr: String,

    /// PEM certificate chain; generated when unset
    pub crt_path: Option<PathBuf>,

    /// PEM private key matching `crt_path`
    pub key_path: Option<PathBuf>,

    /// Replace the Host header of forwarded requests
    pub host_header_rewrite: Option<String>,

    #[serde(default)]
    pub request_headers: RequestHeaders,

    /// Limit for receiving a request head (and the TLS handshake)
    #[serde(default = "default_read_header_timeout")]
    pub read_header_timeout_secs: u64,

    /// Connections served at once; later ones wait for a free slot
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest HTTP read buffer of one connection, in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Https2HttpOptions {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            crt_path: None,
            key_path: None,
            host_header_rewrite: None,
            request_headers: RequestHeaders::default(),
            read_header_timeout_secs: default_read_header_timeout(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
        }
    }

    /// Builder pattern: serve the given certificate and key
    pub fn with_certificate(mut self, crt_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.crt_path = Some(crt_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    /// Builder pattern: rewrite the Host header
    pub fn with_host_header_rewrite(mut self, host: impl Into<String>) -> Self {
        self.host_header_rewrite = Some(host.into());
        self
    }

    /// Builder pattern: set a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.set.insert(name.into(), value.into());
        self
    }

    pub fn read_header_timeout(&self) -> Duration {
        Duration::from_secs(self.read_header_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_addr.trim().is_empty() {
            return Err(BurrowError::ConfigError(
                "https2http: local_addr is required".to_string(),
            ));
        }
        if self.crt_path.is_some() != self.key_path.is_some() {
            return Err(BurrowError::ConfigError(
                "https2http: crt_path and key_path must be set together".to_string(),
            ));
        }
        if self.read_header_timeout_secs == 0 {
            return Err(BurrowError::ConfigError(
                "https2http: read_header_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(BurrowError::ConfigError(
                "https2http: max_connections must be positive".to_string(),
            ));
        }
        RequestRewriter::new(self)?;
        Ok(())
    }
}

/// Factory registered under [`PLUGIN_HTTPS2HTTP`]
pub fn create(options: &PluginOptions) -> Result<Box<dyn ClientPlugin>> {
    match options {
        PluginOptions::Https2Http(opts) => Ok(Box::new(Https2HttpPlugin::new(opts.clone())?)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request rewriting
// ─────────────────────────────────────────────────────────────────────────────

/// Turns an inbound HTTPS request into the request sent to the local service
#[derive(Debug, Clone)]
struct RequestRewriter {
    local_addr: String,
    host_header_rewrite: Option<HeaderValue>,
    set_headers: Vec<(HeaderName, HeaderValue)>,
}

impl RequestRewriter {
    fn new(opts: &Https2HttpOptions) -> Result<Self> {
        let host_header_rewrite = opts
            .host_header_rewrite
            .as_deref()
            .filter(|host| !host.is_empty())
            .map(|host| {
                HeaderValue::from_str(host).map_err(|e| {
                    BurrowError::ConfigError(format!("https2http: bad host_header_rewrite: {}", e))
                })
            })
            .transpose()?;

        let set_headers = opts
            .request_headers
            .set
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    BurrowError::ConfigError(format!("https2http: bad header name {}: {}", name, e))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    BurrowError::ConfigError(format!("https2http: bad value for {}: {}", name, e))
                })?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            local_addr: opts.local_addr.clone(),
            host_header_rewrite,
            set_headers,
        })
    }

    /// Rewrite the request head in place. Returns the plain-HTTP target.
    fn rewrite(&self, parts: &mut http::request::Parts) -> Result<Uri> {
        let inbound_host = parts.headers.get(header::HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        });

        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .to_string();

        let target = Uri::builder()
            .scheme("http")
            .authority(self.local_addr.as_str())
            .path_and_query(path.as_str())
            .build()
            .map_err(|e| BurrowError::ProxyError(format!("Bad target URI: {}", e)))?;

        // Origin-form on the wire; the connection itself goes to local_addr.
        parts.uri = Uri::builder()
            .path_and_query(path.as_str())
            .build()
            .map_err(|e| BurrowError::ProxyError(format!("Bad request path: {}", e)))?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);

        match (&self.host_header_rewrite, &inbound_host) {
            (Some(host), _) | (None, Some(host)) => {
                parts.headers.insert(header::HOST, host.clone());
            }
            (None, None) => {}
        }

        // X-Forwarded-For stays exactly as the tunnel peer sent it.
        if let Some(host) = inbound_host {
            parts.headers.insert(X_FORWARDED_HOST.clone(), host);
        }
        parts
            .headers
            .insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("https"));

        for (name, value) in &self.set_headers {
            parts.headers.insert(name.clone(), value.clone());
        }

        Ok(target)
    }
}

fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reverse proxy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ReverseProxy {
    rewriter: RequestRewriter,
}

impl ReverseProxy {
    async fn forward(&self, req: Request<Incoming>, peer: Option<SocketAddr>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.try_forward(req).await {
            Ok(response) => {
                debug!("{} {} -> {}", method, path, response.status());
                response
            }
            Err(e) => {
                warn!("Proxying {} {} from {:?} failed: {}", method, path, peer, e);
                bad_gateway()
            }
        }
    }

    async fn try_forward(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let (mut parts, body) = req.into_parts();
        let target = self.rewriter.rewrite(&mut parts)?;
        let addr = target
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| self.rewriter.local_addr.clone());

        let unavailable = |reason: String| BurrowError::UpstreamUnavailable {
            addr: addr.clone(),
            reason,
        };

        let stream = timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| unavailable("connect timeout".to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let response = sender
            .send_request(Request::from_parts(parts, body))
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn bad_gateway() -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(b"Bad Gateway"))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin
// ─────────────────────────────────────────────────────────────────────────────

enum ServerState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Everything the accept loop needs, shared with per-connection tasks
struct Server {
    listener: Arc<BridgeListener>,
    acceptor: TlsAcceptor,
    proxy: Arc<ReverseProxy>,
    connections: Arc<Semaphore>,
    buffer_size: usize,
    header_timeout: Duration,
    shutdown: CancellationToken,
}

impl Server {
    async fn run(self: Arc<Self>) {
        info!("https2http server accepting tunneled connections");
        let mut connections = JoinSet::new();

        loop {
            let conn = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("https2http connection task panicked: {}", e);
                        }
                    }
                    continue;
                }
                conn = self.listener.accept() => conn,
            };

            match conn {
                Ok(conn) => {
                    let server = Arc::clone(&self);
                    connections.spawn(async move { server.serve_connection(conn).await });
                }
                Err(e) => {
                    debug!("https2http accept loop ending: {}", e);
                    break;
                }
            }
        }

        // In-flight connections are cut off.
        connections.shutdown().await;
        info!("https2http server stopped");
    }

    async fn serve_connection(&self, conn: ConnectionEnvelope) {
        let peer = conn.remote_addr();

        let slot = match Arc::clone(&self.connections).acquire_owned().await {
            Ok(slot) => slot,
            Err(_) => {
                debug!("Dropping connection from {:?}: plugin closing", peer);
                return;
            }
        };

        let tls_stream = match timeout(self.header_timeout, self.acceptor.accept(conn)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("TLS handshake with {:?} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!("TLS handshake with {:?} timed out", peer);
                return;
            }
        };
        debug!("TLS handshake with {:?} completed", peer);

        let proxy = Arc::clone(&self.proxy);
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = Arc::clone(&proxy);
            async move { Ok::<_, Infallible>(proxy.forward(req, peer).await) }
        });

        let mut builder = hyper::server::conn::http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_timeout)
            .max_buf_size(self.buffer_size)
            .keep_alive(true);

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = builder.serve_connection(TokioIo::new(tls_stream), service) => result,
        };

        if let Err(e) = result {
            debug!("HTTP connection from {:?} ended: {}", peer, e);
        }
        drop(slot);
    }
}

/// TLS-terminating reverse proxy towards a local HTTP service
pub struct Https2HttpPlugin {
    options: Https2HttpOptions,
    server: Arc<Server>,
    state: Mutex<ServerState>,
}

impl Https2HttpPlugin {
    /// Build the plugin. TLS material and header options are checked here,
    /// so a bad configuration never reaches `start()`.
    pub fn new(options: Https2HttpOptions) -> Result<Self> {
        options.validate()?;

        let tls_config = match (&options.crt_path, &options.key_path) {
            (Some(crt), Some(key)) => tls::server_config_from_pem(crt, key)?,
            _ => tls::self_signed_server_config()?,
        };

        let server = Server {
            listener: Arc::new(BridgeListener::new(
                DEFAULT_QUEUE_CAPACITY,
                BackpressurePolicy::Reject,
            )),
            acceptor: TlsAcceptor::from(tls_config),
            proxy: Arc::new(ReverseProxy {
                rewriter: RequestRewriter::new(&options)?,
            }),
            connections: Arc::new(Semaphore::new(options.max_connections)),
            buffer_size: options.buffer_size.max(MIN_BUFFER_SIZE),
            header_timeout: options.read_header_timeout(),
            shutdown: CancellationToken::new(),
        };

        Ok(Self {
            options,
            server: Arc::new(server),
            state: Mutex::new(ServerState::Idle),
        })
    }

    pub fn options(&self) -> &Https2HttpOptions {
        &self.options
    }

    /// The bridge listener fed by `handle`
    pub fn listener(&self) -> &BridgeListener {
        &self.server.listener
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*state, ServerState::Running(ref handle) if !handle.is_finished())
    }
}

impl ClientPlugin for Https2HttpPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_HTTPS2HTTP
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            ServerState::Idle => {
                let server = Arc::clone(&self.server);
                *state = ServerState::Running(tokio::spawn(server.run()));
                info!(
                    "https2http plugin started, forwarding to {}",
                    self.options.local_addr
                );
                Ok(())
            }
            ServerState::Running(_) => Err(BurrowError::ProxyError(
                "https2http plugin already started".to_string(),
            )),
            ServerState::Stopped => Err(BurrowError::ProxyError(
                "https2http plugin is closed".to_string(),
            )),
        }
    }

    fn handle(&self, conn: ConnectionEnvelope, extra: &ExtraInfo) -> Result<()> {
        debug!(
            "https2http queueing connection from {:?} (dst {:?})",
            extra.src_addr, extra.dst_addr
        );
        self.server.listener.put_conn(conn)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.server.shutdown.cancel();
            self.server.listener.close();
            self.server.connections.close();

            let previous = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *state, ServerState::Stopped)
            };

            if let ServerState::Running(mut handle) = previous {
                if timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                    warn!("https2http server did not stop in time, aborting");
                    handle.abort();
                }
                info!("https2http plugin closed");
            }
        })
    }
}
