use super::{Platform, PlatformAdapter, PlatformError, PlatformResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Platform adapters keyed by platform
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the platform it reports
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Register or replace an adapter
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    /// Adapter for `platform`
    pub fn get(&self, platform: Platform) -> PlatformResult<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned().ok_or_else(|| {
            PlatformError::NotImplemented(format!("no adapter registered for {}", platform))
        })
    }

    /// Registered platforms
    #[must_use]
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }
}
