//! Plugin Registry
//!
//! Maps plugin type names to factories. Filled once at startup through
//! [`PluginRegistry::builtin`] and only read afterwards.

use std::collections::HashMap;
use tracing::{debug, info};

use super::{ClientPlugin, PLUGIN_HTTPS2HTTP, PluginOptions, https2http};
use crate::error::{BurrowError, Result};

/// Builds a plugin from its typed options
pub type PluginFactory = fn(&PluginOptions) -> Result<Box<dyn ClientPlugin>>;

/// Name to factory table
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<&'static str, PluginFactory>,
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(PLUGIN_HTTPS2HTTP, https2http::create)?;
        debug!("Registered {} built-in plugin(s)", registry.len());
        Ok(registry)
    }

    /// Register a factory. A name can only be registered once.
    pub fn register(&mut self, name: &'static str, factory: PluginFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(BurrowError::DuplicatePlugin(name.to_string()));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Construct a plugin for the given options
    pub fn create(&self, options: &PluginOptions) -> Result<Box<dyn ClientPlugin>> {
        let name = options.plugin_type();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BurrowError::UnknownPlugin(name.to_string()))?;

        options.validate()?;
        let plugin = factory(options)?;
        info!("Created plugin {}", name);
        Ok(plugin)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Https2HttpOptions;
    use crate::proxy::{ConnectionEnvelope, ExtraInfo};
    use futures::future::BoxFuture;

    struct NoopPlugin;

    impl ClientPlugin for NoopPlugin {
        fn name(&self) -> &'static str {
            PLUGIN_HTTPS2HTTP
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn handle(&self, _conn: ConnectionEnvelope, _extra: &ExtraInfo) -> Result<()> {
            Ok(())
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn noop_factory(_: &PluginOptions) -> Result<Box<dyn ClientPlugin>> {
        Ok(Box::new(NoopPlugin))
    }

    fn options() -> PluginOptions {
        PluginOptions::Https2Http(Https2HttpOptions::new("127.0.0.1:8080"))
    }

    #[test]
    fn test_unknown_plugin() {
        let registry = PluginRegistry::new();
        for _ in 0..3 {
            let err = registry.create(&options()).err().unwrap();
            assert!(matches!(err, BurrowError::UnknownPlugin(ref name) if name == PLUGIN_HTTPS2HTTP));
        }
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = PluginRegistry::new();
        registry.register(PLUGIN_HTTPS2HTTP, noop_factory).unwrap();

        let err = registry.register(PLUGIN_HTTPS2HTTP, noop_factory).unwrap_err();
        assert!(matches!(err, BurrowError::DuplicatePlugin(_)));
        assert!(err.is_startup_fatal());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_uses_registered_factory() {
        let mut registry = PluginRegistry::new();
        registry.register(PLUGIN_HTTPS2HTTP, noop_factory).unwrap();

        let plugin = registry.create(&options()).unwrap();
        assert_eq!(plugin.name(), PLUGIN_HTTPS2HTTP);
    }

    #[test]
    fn test_create_validates_options() {
        let mut registry = PluginRegistry::new();
        registry.register(PLUGIN_HTTPS2HTTP, noop_factory).unwrap();

        let bad = PluginOptions::Https2Http(Https2HttpOptions::new(""));
        assert!(matches!(registry.create(&bad), Err(BurrowError::ConfigError(_))));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = PluginRegistry::builtin().unwrap();
        assert!(registry.contains(PLUGIN_HTTPS2HTTP));
        assert_eq!(registry.names(), vec![PLUGIN_HTTPS2HTTP]);
    }
}
