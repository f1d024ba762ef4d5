//! Branding Constants
//!
//! Single source of truth for product naming and branding.

/// Product display name
pub const PRODUCT_NAME: &str = "Burrow";

/// Binary executable name
pub const BIN_NAME: &str = "burrow";

/// Peer link scheme (e.g., burrow://PEER_ID)
pub const LINK_SCHEME: &str = "burrow";

/// Short description
pub const DESCRIPTION: &str = "Reverse-Tunnel Client with P2P Fallback";
