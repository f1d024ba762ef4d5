//! Burrow Core Library
//!
//! This crate provides the client-side tunneling logic for Burrow.
//! It includes:
//! - Connection envelopes and the bridge listener feeding stream servers
//! - The plugin registry and the HTTPS-to-HTTP reverse proxy plugin
//! - The visitor fallback controller (direct tunnel first, relay after)
//! - libp2p swarm management with QUIC, relay and DCUtR

pub mod brand;
pub mod config;
pub mod error;
pub mod network;
pub mod plugin;
pub mod protocol;
pub mod proxy;
pub mod visitor;

pub use config::{ClientConfig, ProxyConfig, ProxyKind, VisitorConfig, VisitorKind};
pub use error::{BurrowError, Result};
pub use network::{NetworkEvent, NetworkHandle, PeerIdentity, PeerNetwork, TUNNEL_PROTOCOL};
pub use plugin::{ClientPlugin, PluginOptions, PluginRegistry};
pub use protocol::{TunnelRequest, TunnelResponse, read_frame, write_frame};
pub use proxy::{
    BackpressurePolicy, BridgeListener, BufferPool, ConnectionEnvelope, ExtraInfo, TransportMeta,
};
pub use visitor::{FallbackController, FallbackPolicy, Route, Selected, VisitorState};

// Re-export libp2p types we expose
pub use libp2p::{Multiaddr, PeerId, Stream};
pub use libp2p_stream;
