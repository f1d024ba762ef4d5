//! Error types for Burrow
//!
//! Provides a unified error handling strategy using thiserror.

use thiserror::Error;

/// Result type alias for Burrow operations
pub type Result<T> = std::result::Result<T, BurrowError>;

/// Unified error type for all Burrow operations
#[derive(Error, Debug)]
pub enum BurrowError {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown plugin type: {0}")]
    UnknownPlugin(String),

    #[error("Plugin type registered twice: {0}")]
    DuplicatePlugin(String),

    #[error("Invalid TLS material: {0}")]
    InvalidTls(String),

    // ─────────────────────────────────────────────────────────────
    // Transport Delivery Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Connection queue is closed")]
    QueueClosed,

    #[error("Connection queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Listener closed")]
    ListenerClosed,

    // ─────────────────────────────────────────────────────────────
    // Proxy/Application Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Upstream {addr} unavailable: {reason}")]
    UpstreamUnavailable { addr: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Visitor Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Visitor {0} is closed")]
    VisitorClosed(String),

    #[error("No tunnel available for visitor {visitor}: {reason}")]
    TunnelUnavailable { visitor: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Network Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to initialize P2P network: {0}")]
    NetworkInitialization(String),

    #[error("Dial error: {0}")]
    DialError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Invalid peer ID format: {0}")]
    InvalidPeerId(String),

    #[error("Protocol negotiation failed: {0}")]
    ProtocolNegotiation(String),

    #[error("Tunnel rejected by peer: {0}")]
    Rejected(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BurrowError {
    /// Errors that must stop the affected proxy or visitor from starting.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            BurrowError::ConfigError(_)
                | BurrowError::UnknownPlugin(_)
                | BurrowError::DuplicatePlugin(_)
                | BurrowError::InvalidTls(_)
        )
    }

    /// Errors raised while handing a session to a listener queue.
    pub fn is_delivery_error(&self) -> bool {
        matches!(self, BurrowError::QueueClosed | BurrowError::QueueFull { .. })
    }
}

impl From<libp2p::TransportError<std::io::Error>> for BurrowError {
    fn from(err: libp2p::TransportError<std::io::Error>) -> Self {
        BurrowError::NetworkInitialization(err.to_string())
    }
}

impl From<bincode::Error> for BurrowError {
    fn from(err: bincode::Error) -> Self {
        BurrowError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BurrowError {
    fn from(err: toml::de::Error) -> Self {
        BurrowError::ConfigError(err.to_string())
    }
}

impl From<rustls::Error> for BurrowError {
    fn from(err: rustls::Error) -> Self {
        BurrowError::InvalidTls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BurrowError::UnknownPlugin("socks5".into()).is_startup_fatal());
        assert!(BurrowError::InvalidTls("bad pem".into()).is_startup_fatal());
        assert!(!BurrowError::QueueClosed.is_startup_fatal());

        assert!(BurrowError::QueueFull { capacity: 8 }.is_delivery_error());
        assert!(!BurrowError::ListenerClosed.is_delivery_error());
    }
}
