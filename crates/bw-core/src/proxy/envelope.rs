//! Connection Envelope
//!
//! A tunneled byte stream together with the metadata the transport layer
//! knows about it. The raw stream alone may carry no addressing at all
//! (multiplexed streams have none), so the envelope keeps the real
//! transport-level information next to it.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Any bidirectional byte stream a tunnel can deliver
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed tunnel stream
pub type BoxedIo = Box<dyn TunnelIo>;

/// Per-session metadata attached by the transport layer
#[derive(Debug, Clone, Default)]
pub struct ExtraInfo {
    /// Address of the original requester, if known
    pub src_addr: Option<SocketAddr>,

    /// Original destination the requester dialed
    pub dst_addr: Option<SocketAddr>,

    /// Free-form attributes (proxy name, visitor name, ...)
    pub attributes: HashMap<String, String>,
}

impl ExtraInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_src_addr(mut self, addr: SocketAddr) -> Self {
        self.src_addr = Some(addr);
        self
    }

    pub fn with_dst_addr(mut self, addr: SocketAddr) -> Self {
        self.dst_addr = Some(addr);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// What the carrying transport connection knows about the peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMeta {
    /// Remote peer identity (libp2p peer id, string form)
    pub peer: Option<String>,

    /// Remote socket address, when the transport exposes one
    pub remote_addr: Option<SocketAddr>,

    /// Local socket address
    pub local_addr: Option<SocketAddr>,

    /// Whether the carrying connection goes through a relay
    pub relayed: bool,
}

/// A tunneled connection handed from the transport layer to a handler.
///
/// The metadata is fixed at construction. The stream is owned by value:
/// whoever holds the envelope is the only one able to read or write it.
pub struct ConnectionEnvelope {
    stream: BoxedIo,
    transport: Option<TransportMeta>,
    remote_addr: Option<SocketAddr>,
}

impl ConnectionEnvelope {
    /// Wrap a stream. `extra.src_addr` takes precedence over the transport's
    /// own remote address, since behind a relay the transport only sees the
    /// relay.
    pub fn new<S: TunnelIo>(stream: S, transport: Option<TransportMeta>, extra: &ExtraInfo) -> Self {
        let remote_addr = extra
            .src_addr
            .or_else(|| transport.as_ref().and_then(|t| t.remote_addr));

        Self {
            stream: Box::new(stream),
            transport,
            remote_addr,
        }
    }

    /// Wrap a stream without any metadata
    pub fn bare<S: TunnelIo>(stream: S) -> Self {
        Self::new(stream, None, &ExtraInfo::default())
    }

    /// Effective remote address of the requester
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Local address of the carrying connection
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.local_addr)
    }

    /// Transport-level metadata
    pub fn transport(&self) -> Option<&TransportMeta> {
        self.transport.as_ref()
    }

    /// Give up the envelope and take the raw stream
    pub fn into_stream(self) -> BoxedIo {
        self.stream
    }
}

impl fmt::Debug for ConnectionEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEnvelope")
            .field("remote_addr", &self.remote_addr)
            .field("transport", &self.transport)
            .finish()
    }
}

impl AsyncRead for ConnectionEnvelope {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ConnectionEnvelope {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
