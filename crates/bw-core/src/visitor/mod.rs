//! Visitors
//!
//! A visitor exposes a remote proxy as a local listener. Every accepted
//! local connection asks the [`FallbackController`] for a tunnel.

pub mod fallback;

pub use fallback::{
    DEFAULT_FALLBACK_TIMEOUT, Establish, FallbackController, FallbackPolicy, Route, Selected,
    VisitorState,
};
