//! Verify Command Implementation

use anyhow::{Context, Result, bail};
use bw_core::{ClientConfig, PluginRegistry};
use std::collections::HashMap;
use std::path::PathBuf;

/// Load the configuration, check every proxy and visitor on its own, then
/// report. A broken unit is listed without hiding the others.
pub fn run(path: PathBuf) -> Result<()> {
    let config = ClientConfig::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let registry = PluginRegistry::builtin()?;
    let problems = unit_problems(&config, &registry);

    println!("{}", path.display());
    for proxy in &config.proxies {
        let target = match &proxy.plugin {
            Some(options) => format!("plugin {}", options.plugin_type()),
            None => proxy.local_target().unwrap_or_default(),
        };
        println!(
            "  proxy   {:<16} {:?} -> {}{}",
            proxy.name,
            proxy.kind,
            target,
            status(&problems, &proxy.name)
        );
    }
    for visitor in &config.visitors {
        let fallback = match &visitor.fallback_to {
            Some(name) => format!(", falls back to {} after {}ms", name, visitor.fallback_timeout_ms),
            None => String::new(),
        };
        println!(
            "  visitor {:<16} {} -> {}{}{}",
            visitor.name,
            visitor.kind,
            visitor.server_name,
            fallback,
            status(&problems, &visitor.name)
        );
    }

    if !problems.is_empty() {
        bail!("{} unit(s) would be disabled", problems.len());
    }
    Ok(())
}

fn status(problems: &HashMap<String, String>, name: &str) -> String {
    match problems.get(name) {
        Some(reason) => format!("  [disabled: {}]", reason),
        None => String::new(),
    }
}

/// Problem per unit name. Plugins are built once since they load their TLS
/// material at construction.
fn unit_problems(config: &ClientConfig, registry: &PluginRegistry) -> HashMap<String, String> {
    let mut problems: HashMap<String, String> = config
        .unit_errors()
        .into_iter()
        .map(|(name, e)| (name, e.to_string()))
        .collect();

    for proxy in &config.proxies {
        if problems.contains_key(&proxy.name) {
            continue;
        }
        if let Some(options) = &proxy.plugin {
            if let Err(e) = registry.create(options) {
                problems.insert(proxy.name.clone(), e.to_string());
            }
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use bw_core::PeerIdentity;

    #[test]
    fn test_problems_are_reported_per_unit() {
        let toml = format!(
            r#"
            [[proxies]]
            name = "ssh"
            type = "tcp"
            local_port = 22

            [[proxies]]
            name = "web"
            type = "stcp"
            [proxies.plugin]
            type = "https2http"
            local_addr = "127.0.0.1:8080"
            crt_path = "/nonexistent/server.crt"
            key_path = "/nonexistent/server.key"

            [[visitors]]
            name = "p2p"
            type = "xtcp"
            server_name = "ssh"
            server_peer = "{peer}"
            fallback_to = "missing"
            "#,
            peer = PeerIdentity::generate().to_link()
        );
        let config = ClientConfig::from_toml_str(&toml).unwrap();
        let registry = PluginRegistry::builtin().unwrap();

        let problems = unit_problems(&config, &registry);
        assert_eq!(problems.len(), 2);
        assert!(problems.contains_key("web"));
        assert!(problems["p2p"].contains("missing"));
        assert!(!problems.contains_key("ssh"));
    }
}
