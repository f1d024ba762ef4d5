//! Client Plugins
//!
//! A plugin intercepts tunneled connections for a proxy before they reach
//! the local service and reshapes them (TLS termination, header rewriting).
//! Plugins are created by name through the [`PluginRegistry`] from the
//! typed options declared in the proxy configuration.

pub mod https2http;
pub mod registry;
pub mod tls;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::proxy::{ConnectionEnvelope, ExtraInfo};

pub use https2http::{Https2HttpOptions, Https2HttpPlugin, RequestHeaders};
pub use registry::{PluginFactory, PluginRegistry};

/// Registry name of the HTTPS-to-HTTP plugin
pub const PLUGIN_HTTPS2HTTP: &str = "https2http";

/// Contract every plugin satisfies
pub trait ClientPlugin: Send + Sync {
    /// Registry name of this plugin
    fn name(&self) -> &'static str;

    /// Launch the plugin's embedded server. Fails if already started.
    fn start(&self) -> Result<()>;

    /// Take one tunneled connection. Only queues it; the protocol work
    /// happens on the plugin's own tasks. Queue errors go back to the caller.
    fn handle(&self, conn: ConnectionEnvelope, extra: &ExtraInfo) -> Result<()>;

    /// Stop the embedded server and release every resource. Idempotent and
    /// safe to call while `handle` runs; in-flight connections are dropped.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Per-plugin options, selected by the `type` key of `[proxies.plugin]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PluginOptions {
    #[serde(rename = "https2http")]
    Https2Http(Https2HttpOptions),
}

impl PluginOptions {
    /// Registry name this configuration resolves to
    pub fn plugin_type(&self) -> &'static str {
        match self {
            PluginOptions::Https2Http(_) => PLUGIN_HTTPS2HTTP,
        }
    }

    /// Check the options before anything is constructed
    pub fn validate(&self) -> Result<()> {
        match self {
            PluginOptions::Https2Http(opts) => opts.validate(),
        }
    }
}
