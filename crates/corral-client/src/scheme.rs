use std::collections::HashMap;
use std::sync::Arc;

use corral_common::{CorralError, Result};
use parking_lot::RwLock;

use crate::picker::Balancer;
use crate::resolver::ResolverBuilder;

/// Resolver and balancer pair bound to one target scheme.
#[derive(Clone)]
pub struct SchemeEntry {
    pub resolver: Arc<dyn ResolverBuilder>,
    pub balancer: Arc<dyn Balancer>,
}

/// Scheme lookup for dialing.
///
/// Owned by the application context rather than held in a global, so tests
/// and embedded clients can register their own schemes side by side.
#[derive(Default)]
pub struct SchemeRegistry {
    entries: RwLock<HashMap<String, SchemeEntry>>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `scheme`, replacing any previous entry.
    pub fn register(&self, scheme: impl Into<String>, resolver: Arc<dyn ResolverBuilder>, balancer: Arc<dyn Balancer>) {
        let scheme = scheme.into();
        tracing::debug!(scheme = %scheme, balancer = balancer.name(), "registering scheme");
        self.entries
            .write()
            .insert(scheme, SchemeEntry { resolver, balancer });
    }

    pub fn get(&self, scheme: &str) -> Result<SchemeEntry> {
        self.entries
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| CorralError::UnknownScheme(scheme.to_string()))
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.entries.read().contains_key(scheme)
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.entries.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::RoundRobinBalancer;
    use crate::resolver::RegistryResolverBuilder;
    use corral_registry::{MemoryStore, Registry};

    fn resolver() -> Arc<dyn ResolverBuilder> {
        Arc::new(RegistryResolverBuilder::new(
            Registry::new(Arc::new(MemoryStore::new())),
            Default::default(),
        ))
    }

    #[test]
    fn test_register_and_get() {
        let schemes = SchemeRegistry::new();
        schemes.register("corral", resolver(), Arc::new(RoundRobinBalancer));

        assert!(schemes.contains("corral"));
        let entry = schemes.get("corral").unwrap();
        assert_eq!(entry.balancer.name(), RoundRobinBalancer::NAME);
        assert_eq!(schemes.schemes(), vec!["corral".to_string()]);
    }

    #[test]
    fn test_unknown_scheme() {
        let schemes = SchemeRegistry::new();
        assert!(matches!(schemes.get("dns"), Err(CorralError::UnknownScheme(s)) if s == "dns"));
    }
}
