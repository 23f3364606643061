use std::sync::Arc;

use corral_common::{AdmissionConfig, AdmissionController, CorralError, Result, Shutdown};
use corral_registry::Registry;

use crate::channel::{Channel, DialOptions};
use crate::conn_cache::{ConnectionCache, SchemeDialer};
use crate::picker::RoundRobinBalancer;
use crate::resolver::{RegistryResolverBuilder, ResolverConfig};
use crate::scheme::SchemeRegistry;
use crate::target::Target;

/// Scheme bound to the registry resolver by default.
pub const DEFAULT_SCHEME: &str = "corral";

/// Client-side settings for an [`AppContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Scheme used when looking services up by name.
    pub scheme: String,
    pub resolver: ResolverConfig,
    pub dial: DialOptions,
}

impl ClientConfig {
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_dial(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.scheme.is_empty() {
            return Err("scheme must not be empty".into());
        }
        self.resolver.validate()?;
        self.dial.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            resolver: ResolverConfig::default(),
            dial: DialOptions::default(),
        }
    }
}

/// Everything a process shares across calls: the shutdown signal, the
/// registry, the scheme map and the connection cache.
///
/// Build one per process and pass it by reference.
pub struct AppContext {
    shutdown: Shutdown,
    registry: Registry,
    schemes: Arc<SchemeRegistry>,
    dialer: Arc<SchemeDialer>,
    connections: ConnectionCache,
    config: ClientConfig,
}

impl AppContext {
    /// Creates a context with the registry resolver and round-robin balancer
    /// bound to `config.scheme`.
    pub fn new(registry: Registry, config: ClientConfig, shutdown: Shutdown) -> Result<Self> {
        let schemes = Arc::new(SchemeRegistry::new());
        schemes.register(
            config.scheme.clone(),
            Arc::new(RegistryResolverBuilder::new(registry.clone(), config.resolver.clone())),
            Arc::new(RoundRobinBalancer),
        );
        Self::with_schemes(registry, schemes, config, shutdown)
    }

    /// Creates a context over a caller-built scheme map.
    pub fn with_schemes(
        registry: Registry,
        schemes: Arc<SchemeRegistry>,
        config: ClientConfig,
        shutdown: Shutdown,
    ) -> Result<Self> {
        config.validate().map_err(CorralError::InvalidConfig)?;

        let dialer = Arc::new(SchemeDialer::new(
            schemes.clone(),
            config.scheme.clone(),
            shutdown.clone(),
            config.dial.clone(),
        ));
        let connections = ConnectionCache::new(dialer.clone());

        Ok(Self {
            shutdown,
            registry,
            schemes,
            dialer,
            connections,
            config,
        })
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn schemes(&self) -> &Arc<SchemeRegistry> {
        &self.schemes
    }

    pub fn connections(&self) -> &ConnectionCache {
        &self.connections
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared channel to `service_name`.
    pub async fn connection(&self, service_name: &str) -> Result<Channel> {
        self.connections.get(service_name).await
    }

    /// Dials a fresh, uncached channel to `target`.
    pub async fn dial(&self, target: &str) -> Result<Channel> {
        self.dialer.dial_target(Target::parse(target)?).await
    }

    /// Admission controller tied to this context's shutdown.
    pub fn admission(&self, config: AdmissionConfig) -> Result<AdmissionController> {
        AdmissionController::new(config, self.shutdown.clone())
    }

    /// Fires shutdown and closes every cached channel.
    pub async fn close(&self) {
        self.shutdown.trigger();
        self.connections.close_all().await;
        tracing::info!("client context closed");
    }
}
