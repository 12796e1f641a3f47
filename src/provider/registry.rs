use super::backend::{ConnectionController, ControllerFactory};
use super::{n2n, nebula, tailscale, tinc, weron, zerotier};
use crate::error::{PluginError, PluginResult};
use std::collections::BTreeMap;
use tracing::debug;

/// Maps provider names to controller factories
pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, ControllerFactory>,
}

impl ProviderRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// All providers shipped with this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(n2n::PROVIDER, n2n::create_controller);
        registry.register(nebula::PROVIDER, nebula::create_controller);
        registry.register(tailscale::PROVIDER, tailscale::create_controller);
        registry.register(tinc::PROVIDER, tinc::create_controller);
        registry.register(weron::PROVIDER, weron::create_controller);
        registry.register(zerotier::PROVIDER, zerotier::create_controller);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ControllerFactory) {
        debug!("Registering provider: {}", name);
        self.factories.insert(name, factory);
    }

    pub fn available(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> PluginResult<Box<dyn ConnectionController>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            PluginError::InvalidSettings(format!(
                "Unknown provider '{}' (available: {})",
                name,
                self.available().join(", ")
            ))
        })?;
        Ok(factory())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
