//! Configuration management for Burrow
//!
//! The client is described by one TOML file: where the relay server lives,
//! which local services are exposed as proxies, and which remote proxies
//! are made reachable locally through visitors.

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::brand;
use crate::error::{BurrowError, Result};
use crate::network::PeerIdentity;
use crate::plugin::PluginOptions;
use crate::visitor::FallbackPolicy;

fn default_identity_path() -> PathBuf {
    ClientConfig::default_identity_path()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_fallback_timeout_ms() -> u64 {
    1000
}

/// Main configuration of a Burrow client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Multiaddr of the relay server, including its `/p2p/` peer ID
    #[serde(alias = "serverAddr")]
    pub server_addr: Option<String>,

    /// Path to the identity keypair file
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,

    /// Port for the local QUIC listener (0 = random)
    #[serde(default)]
    pub listen_port: u16,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub visitors: Vec<VisitorConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: None,
            identity_path: Self::default_identity_path(),
            listen_port: 0,
            idle_timeout_secs: default_idle_timeout(),
            proxies: Vec::new(),
            visitors: Vec::new(),
        }
    }
}

/// Kinds of exposed proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Reachable by any peer
    Tcp,
    /// Secret-protected, reached over the relay
    Stcp,
    /// Secret-protected, reached over a hole-punched connection
    Xtcp,
}

impl ProxyKind {
    pub fn requires_secret(self) -> bool {
        matches!(self, ProxyKind::Stcp | ProxyKind::Xtcp)
    }
}

/// A local service exposed to visitors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ProxyKind,

    #[serde(default = "default_local_ip", alias = "localIP")]
    pub local_ip: String,

    #[serde(alias = "localPort")]
    pub local_port: Option<u16>,

    #[serde(default, alias = "secretKey")]
    pub secret_key: String,

    /// Replaces the plain local forward when set
    pub plugin: Option<PluginOptions>,
}

impl ProxyConfig {
    /// `local_ip:local_port`, when the proxy forwards to a local port
    pub fn local_target(&self) -> Option<String> {
        self.local_port
            .map(|port| format!("{}:{}", self.local_ip, port))
    }

    /// Check this proxy on its own. A failure disables only this proxy.
    pub fn validate(&self) -> Result<()> {
        match &self.plugin {
            Some(plugin) => plugin.validate(),
            None if self.local_port.is_none() => Err(BurrowError::ConfigError(format!(
                "proxy {}: needs local_port or a plugin",
                self.name
            ))),
            None => Ok(()),
        }
    }
}

/// Kinds of visitors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitorKind {
    Stcp,
    Xtcp,
}

impl std::fmt::Display for VisitorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisitorKind::Stcp => write!(f, "stcp"),
            VisitorKind::Xtcp => write!(f, "xtcp"),
        }
    }
}

/// A remote proxy made reachable on a local port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: VisitorKind,

    /// Proxy name on the remote peer
    #[serde(alias = "serverName")]
    pub server_name: String,

    /// `burrow://` link of the peer running the proxy
    #[serde(alias = "serverPeer")]
    pub server_peer: String,

    #[serde(default, alias = "secretKey")]
    pub secret_key: String,

    #[serde(default = "default_bind_addr", alias = "bindAddr")]
    pub bind_addr: String,

    /// Negative: no local listener, the visitor only serves as a fallback
    #[serde(default, alias = "bindPort")]
    pub bind_port: i32,

    #[serde(default, alias = "keepTunnelOpen")]
    pub keep_tunnel_open: bool,

    /// Name of an stcp visitor used when the direct tunnel is late
    #[serde(alias = "fallbackTo")]
    pub fallback_to: Option<String>,

    #[serde(default = "default_fallback_timeout_ms", alias = "fallbackTimeoutMs")]
    pub fallback_timeout_ms: u64,
}

impl VisitorConfig {
    /// Local listen address, or `None` for fallback-only visitors
    pub fn bind_socket(&self) -> Result<Option<SocketAddr>> {
        if self.bind_port < 0 {
            return Ok(None);
        }
        let port = u16::try_from(self.bind_port).map_err(|_| {
            BurrowError::ConfigError(format!(
                "visitor {}: bind_port {} out of range",
                self.name, self.bind_port
            ))
        })?;
        let ip: IpAddr = self.bind_addr.parse().map_err(|e| {
            BurrowError::ConfigError(format!(
                "visitor {}: bad bind_addr {}: {}",
                self.name, self.bind_addr, e
            ))
        })?;
        Ok(Some(SocketAddr::new(ip, port)))
    }

    pub fn server_peer_id(&self) -> Result<PeerId> {
        PeerIdentity::parse_link(&self.server_peer)
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy::default()
            .with_fallback_timeout(Duration::from_millis(self.fallback_timeout_ms))
            .with_keep_tunnel_open(self.keep_tunnel_open)
    }

    /// Check this visitor; `siblings` resolves `fallback_to`. A failure
    /// disables only this visitor.
    pub fn validate(&self, siblings: &[VisitorConfig]) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(BurrowError::ConfigError(format!(
                "visitor {}: server_name is required",
                self.name
            )));
        }
        self.server_peer_id()?;
        self.bind_socket()?;

        let Some(target) = &self.fallback_to else {
            return Ok(());
        };
        if self.kind != VisitorKind::Xtcp {
            return Err(BurrowError::ConfigError(format!(
                "visitor {}: fallback_to is only supported on xtcp visitors",
                self.name
            )));
        }
        match siblings.iter().find(|v| &v.name == target).map(|v| v.kind) {
            Some(VisitorKind::Stcp) => {}
            Some(kind) => {
                return Err(BurrowError::ConfigError(format!(
                    "visitor {}: fallback {} must be stcp, not {}",
                    self.name, target, kind
                )));
            }
            None => {
                return Err(BurrowError::ConfigError(format!(
                    "visitor {}: unknown fallback visitor {}",
                    self.name, target
                )));
            }
        }
        if self.fallback_timeout_ms == 0 {
            return Err(BurrowError::ConfigError(format!(
                "visitor {}: fallback_timeout_ms must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BurrowError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses and validates a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| BurrowError::ConfigError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(brand::BIN_NAME)
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default identity keypair path
    pub fn default_identity_path() -> PathBuf {
        Self::default_config_dir().join("identity.key")
    }

    /// Identity path with a leading `~/` expanded
    pub fn resolved_identity_path(&self) -> PathBuf {
        match self.identity_path.strip_prefix("~") {
            Ok(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| self.identity_path.clone()),
            Err(_) => self.identity_path.clone(),
        }
    }

    /// Relay server address, when configured
    pub fn server_multiaddr(&self) -> Result<Option<Multiaddr>> {
        self.server_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<Multiaddr>().map_err(|e| {
                    BurrowError::ConfigError(format!("Invalid server_addr {}: {}", addr, e))
                })
            })
            .transpose()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn visitor(&self, name: &str) -> Option<&VisitorConfig> {
        self.visitors.iter().find(|v| v.name == name)
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyConfig> {
        self.proxies.iter().find(|p| p.name == name)
    }

    /// Builder pattern: set listen port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Builder pattern: set relay server
    pub fn with_server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = Some(addr.into());
        self
    }

    /// Builder pattern: add a proxy
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxies.push(proxy);
        self
    }

    /// Builder pattern: add a visitor
    pub fn with_visitor(mut self, visitor: VisitorConfig) -> Self {
        self.visitors.push(visitor);
        self
    }

    /// Document-level checks: relay address and unique names. Problems
    /// inside a single proxy or visitor are left to [`ProxyConfig::validate`]
    /// and [`VisitorConfig::validate`], which only disable that unit.
    pub fn validate(&self) -> Result<()> {
        self.server_multiaddr()?;
        unique_names("proxy", self.proxies.iter().map(|p| p.name.as_str()))?;
        unique_names("visitor", self.visitors.iter().map(|v| v.name.as_str()))?;
        Ok(())
    }

    /// Every per-unit problem, keyed by unit name
    pub fn unit_errors(&self) -> Vec<(String, BurrowError)> {
        let proxies = self
            .proxies
            .iter()
            .filter_map(|p| p.validate().err().map(|e| (p.name.clone(), e)));
        let visitors = self
            .visitors
            .iter()
            .filter_map(|v| v.validate(&self.visitors).err().map(|e| (v.name.clone(), e)));
        proxies.chain(visitors).collect()
    }
}

fn unique_names<'a>(unit: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(BurrowError::ConfigError(format!("{} without a name", unit)));
        }
        if !seen.insert(name) {
            return Err(BurrowError::ConfigError(format!("duplicate {} name {}", unit, name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> String {
        PeerIdentity::generate().to_link()
    }

    fn sample(peer: &str) -> String {
        format!(
            r#"
            listen_port = 4001

            [[proxies]]
            name = "web"
            type = "stcp"
            secret_key = "abc"
            [proxies.plugin]
            type = "https2http"
            local_addr = "127.0.0.1:8080"
            [proxies.plugin.request_headers.set]
            X-Test = "1"

            [[visitors]]
            name = "foo-visitor"
            type = "stcp"
            server_name = "foo"
            server_peer = "{peer}"
            secret_key = "abc"
            bind_port = -1

            [[visitors]]
            name = "bar-visitor"
            type = "xtcp"
            server_name = "bar"
            server_peer = "{peer}"
            bind_port = 9000
            keep_tunnel_open = true
            fallback_to = "foo-visitor"
            fallback_timeout_ms = 200
            "#
        )
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.listen_port, 0);
        assert!(config.proxies.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_sample() {
        let config = ClientConfig::from_toml_str(&sample(&link())).unwrap();

        assert_eq!(config.listen_port, 4001);
        let web = config.proxy("web").unwrap();
        assert_eq!(web.kind, ProxyKind::Stcp);
        assert!(web.plugin.is_some());

        let foo = config.visitor("foo-visitor").unwrap();
        assert_eq!(foo.bind_socket().unwrap(), None);

        let bar = config.visitor("bar-visitor").unwrap();
        assert_eq!(bar.bind_socket().unwrap(), Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(bar.fallback_to.as_deref(), Some("foo-visitor"));
        let policy = bar.fallback_policy();
        assert_eq!(policy.fallback_timeout, Duration::from_millis(200));
        assert!(policy.keep_tunnel_open);
    }

    #[test]
    fn test_fallback_timeout_default() {
        let peer = link();
        let toml = sample(&peer).replace("fallback_timeout_ms = 200", "");
        let config = ClientConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.visitor("bar-visitor").unwrap().fallback_timeout_ms, 1000);
    }

    #[test]
    fn test_fallback_must_be_stcp() {
        let peer = link();
        let toml = sample(&peer).replacen(r#"type = "stcp"
            server_name = "foo""#, r#"type = "xtcp"
            server_name = "foo""#, 1);
        let config = ClientConfig::from_toml_str(&toml).unwrap();

        let bar = config.visitor("bar-visitor").unwrap();
        let err = bar.validate(&config.visitors).unwrap_err();
        assert!(matches!(err, BurrowError::ConfigError(_)));
    }

    #[test]
    fn test_unit_errors_stay_with_their_unit() {
        let peer = link();
        let toml = sample(&peer)
            .replace(r#"fallback_to = "foo-visitor""#, r#"fallback_to = "nope""#)
            .replace("X-Test = \"1\"", "\"bad header\" = \"1\"");

        // The document itself still loads.
        let config = ClientConfig::from_toml_str(&toml).unwrap();

        let mut failed: Vec<_> = config.unit_errors().into_iter().map(|(name, _)| name).collect();
        failed.sort();
        assert_eq!(failed, vec!["bar-visitor".to_string(), "web".to_string()]);
        config.visitor("foo-visitor").unwrap().validate(&config.visitors).unwrap();
    }

    #[test]
    fn test_camel_case_keys() {
        let toml = format!(
            r#"
            [[visitors]]
            name = "relay"
            type = "stcp"
            serverName = "web"
            serverPeer = "{peer}"
            secretKey = "abc"
            bindPort = -1

            [[visitors]]
            name = "p2p"
            type = "xtcp"
            serverName = "web"
            serverPeer = "{peer}"
            bindAddr = "127.0.0.1"
            bindPort = 9001
            keepTunnelOpen = true
            fallbackTo = "relay"
            fallbackTimeoutMs = 200
            "#,
            peer = link()
        );
        let config = ClientConfig::from_toml_str(&toml).unwrap();
        assert!(config.unit_errors().is_empty());

        let p2p = config.visitor("p2p").unwrap();
        assert_eq!(p2p.server_name, "web");
        assert_eq!(p2p.fallback_to.as_deref(), Some("relay"));
        assert_eq!(p2p.fallback_timeout_ms, 200);
        assert!(p2p.keep_tunnel_open);
        assert_eq!(config.visitor("relay").unwrap().secret_key, "abc");
    }

    #[test]
    fn test_duplicate_names() {
        let peer = link();
        let toml = sample(&peer).replace(r#"name = "bar-visitor""#, r#"name = "foo-visitor""#);
        let err = ClientConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn test_proxy_needs_target() {
        let config = ClientConfig::new().with_proxy(ProxyConfig {
            name: "ssh".to_string(),
            kind: ProxyKind::Tcp,
            local_ip: default_local_ip(),
            local_port: None,
            secret_key: String::new(),
            plugin: None,
        });
        config.validate().unwrap();
        assert!(config.proxies[0].validate().is_err());
        assert_eq!(config.unit_errors().len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("burrow.toml");

        let original = ClientConfig::from_toml_str(&sample(&link())).unwrap();
        original.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.visitors.len(), 2);
        assert_eq!(loaded.proxies[0].plugin, original.proxies[0].plugin);
    }
}
