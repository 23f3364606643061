//! Name resolution from the service registry.
//!
//! A [`RegistryResolver`] keeps one logical target's address set fresh. It
//! runs two background tasks:
//!
//! - the registry watch, which turns store mutations into wake-ups
//! - the trigger loop, which re-reads the registry on a wake-up, an explicit
//!   [`Resolver::resolve_now`], or the fallback refresh timer
//!
//! After each resolution the trigger loop sleeps for a quiet period. Wake-ups
//! share one [`Notify`] permit, so any number of triggers during the quiet
//! period collapse into a single follow-up resolution.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_common::{CorralError, Result, Shutdown};
use corral_registry::{EndpointRecord, Registry, ServiceRegistry};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::target::Target;

/// One resolved endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address {
    pub addr: String,
    pub version: String,
}

/// The complete, duplicate-free set of addresses for one service.
///
/// Each update replaces the previous set entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: Vec<Address>,
}

impl AddressSet {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        let unique: BTreeMap<String, Address> = addresses
            .into_iter()
            .map(|address| (address.addr.clone(), address))
            .collect();
        Self {
            addresses: unique.into_values().collect(),
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a EndpointRecord>) -> Self {
        Self::new(records.into_iter().map(|record| Address {
            addr: record.address(),
            version: record.service_version.clone(),
        }))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.addresses.iter()
    }

    pub fn addrs(&self) -> Vec<&str> {
        self.addresses.iter().map(|a| a.addr.as_str()).collect()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addresses.iter().any(|a| a.addr == addr)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Receives resolver output. Implemented by the channel.
#[async_trait]
pub trait ResolverSink: Send + Sync {
    /// Replaces the current address set.
    async fn update_addresses(&self, addresses: AddressSet);

    /// Resolution failed; the current address set stays in place.
    fn report_error(&self, error: CorralError);
}

/// A running resolver for one target.
pub trait Resolver: Send + Sync {
    /// Requests a re-resolution. Coalesces with pending requests.
    fn resolve_now(&self);

    /// Stops all background work.
    fn close(&self);
}

/// Creates resolvers for a scheme.
pub trait ResolverBuilder: Send + Sync {
    fn build(
        &self,
        target: &Target,
        sink: Arc<dyn ResolverSink>,
        shutdown: &Shutdown,
    ) -> Result<Box<dyn Resolver>>;
}

/// Resolver timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Quiet period after each resolution.
    pub min_interval: Duration,
    /// Re-resolve at least this often even without watch events.
    pub refresh_interval: Duration,
    /// Immediate attempts per resolution, without backoff.
    pub max_attempts: u32,
}

impl ResolverConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.refresh_interval.is_zero() {
            return Err("refresh_interval must be greater than 0".into());
        }
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
            refresh_interval: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// Reads the registry once, trying up to `max_attempts` times back to back.
pub async fn resolve_addresses(service: &ServiceRegistry, max_attempts: u32) -> Result<AddressSet> {
    let mut last_err = None;

    for attempt in 1..=max_attempts.max(1) {
        match service.get_configs().await {
            Ok(records) => return Ok(AddressSet::from_records(records.values())),
            Err(e) => {
                tracing::debug!(service = %service.service_name(), attempt, error = %e, "resolve attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CorralError::TransientInfra("no resolve attempt made".into())))
}

/// Builds [`RegistryResolver`]s backed by a shared [`Registry`].
pub struct RegistryResolverBuilder {
    registry: Registry,
    config: ResolverConfig,
}

impl RegistryResolverBuilder {
    pub fn new(registry: Registry, config: ResolverConfig) -> Self {
        Self { registry, config }
    }
}

impl ResolverBuilder for RegistryResolverBuilder {
    fn build(
        &self,
        target: &Target,
        sink: Arc<dyn ResolverSink>,
        shutdown: &Shutdown,
    ) -> Result<Box<dyn Resolver>> {
        self.config.validate().map_err(CorralError::InvalidConfig)?;
        let service = self.registry.service(target.service_name());
        Ok(Box::new(RegistryResolver::start(service, sink, shutdown, self.config.clone())))
    }
}

pub struct RegistryResolver {
    trigger: Arc<Notify>,
    cancel: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryResolver {
    /// Spawns the watch and trigger loops. The first resolution starts immediately.
    ///
    /// Both loops stop on [`close`](Resolver::close), on drop, or when
    /// `shutdown` fires.
    pub fn start(
        service: ServiceRegistry,
        sink: Arc<dyn ResolverSink>,
        shutdown: &Shutdown,
        config: ResolverConfig,
    ) -> Self {
        let cancel = shutdown.child();
        let trigger = Arc::new(Notify::new());
        trigger.notify_one();

        let watch = service.watch(cancel.clone(), trigger.clone());
        let resolve = tokio::spawn(run_trigger_loop(
            service,
            sink,
            trigger.clone(),
            cancel.clone(),
            config,
        ));

        Self {
            trigger,
            cancel,
            tasks: Mutex::new(vec![watch, resolve]),
        }
    }

    /// Waits until both background loops have exited.
    pub async fn closed(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Resolver for RegistryResolver {
    fn resolve_now(&self) {
        self.trigger.notify_one();
    }

    fn close(&self) {
        self.cancel.trigger();
    }
}

impl Drop for RegistryResolver {
    fn drop(&mut self) {
        self.cancel.trigger();
    }
}

async fn run_trigger_loop(
    service: ServiceRegistry,
    sink: Arc<dyn ResolverSink>,
    trigger: Arc<Notify>,
    cancel: Shutdown,
    config: ResolverConfig,
) {
    loop {
        tokio::select! {
            _ = cancel.wait() => break,
            _ = trigger.notified() => {}
            _ = tokio::time::sleep(config.refresh_interval) => {
                tracing::trace!(service = %service.service_name(), "fallback refresh");
            }
        }

        let resolved = tokio::select! {
            _ = cancel.wait() => break,
            resolved = AssertUnwindSafe(resolve_addresses(&service, config.max_attempts)).catch_unwind() => resolved,
        };

        match resolved {
            Ok(Ok(addresses)) => {
                tracing::debug!(
                    service = %service.service_name(),
                    count = addresses.len(),
                    "resolved addresses"
                );
                sink.update_addresses(addresses).await;
            }
            Ok(Err(e)) => {
                tracing::error!(
                    service = %service.service_name(),
                    attempts = config.max_attempts,
                    error = %e,
                    "resolve failed, keeping last known addresses"
                );
                sink.report_error(e);
            }
            Err(_) => {
                tracing::error!(service = %service.service_name(), "resolver panicked, keeping last known addresses");
            }
        }

        tokio::select! {
            _ = cancel.wait() => break,
            _ = tokio::time::sleep(config.min_interval) => {}
        }
    }

    tracing::debug!(service = %service.service_name(), "resolver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_registry::{KeyValue, KvStore, MemoryStore, ServiceKind, WatchEvent};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// MemoryStore that counts listings and can be switched offline.
    struct FlakyStore {
        inner: MemoryStore,
        lists: AtomicUsize,
        offline: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                lists: AtomicUsize::new(0),
                offline: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn create(&self, key: &str, value: String) -> Result<()> {
            self.inner.create(key, value).await
        }
        async fn get(&self, key: &str) -> Result<KeyValue> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(CorralError::TransientInfra("connection refused".into()));
            }
            self.inner.list(prefix).await
        }
        async fn watch(&self, prefix: &str, wait_index: Option<u64>) -> Result<WatchEvent> {
            self.inner.watch(prefix, wait_index).await
        }
    }

    enum Event {
        Update(AddressSet),
        Error,
    }

    struct ChannelSink(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl ResolverSink for ChannelSink {
        async fn update_addresses(&self, addresses: AddressSet) {
            let _ = self.0.send(Event::Update(addresses));
        }
        fn report_error(&self, _error: CorralError) {
            let _ = self.0.send(Event::Error);
        }
    }

    fn fast_config() -> ResolverConfig {
        ResolverConfig::default()
            .with_min_interval(Duration::from_millis(50))
            .with_refresh_interval(Duration::from_secs(60))
    }

    fn start(
        store: Arc<FlakyStore>,
        config: ResolverConfig,
        shutdown: &Shutdown,
    ) -> (Registry, RegistryResolver, mpsc::UnboundedReceiver<Event>) {
        let registry = Registry::new(store);
        let (tx, rx) = mpsc::unbounded_channel();
        let resolver = RegistryResolver::start(
            registry.service("orders"),
            Arc::new(ChannelSink(tx)),
            shutdown,
            config,
        );
        (registry, resolver, rx)
    }

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<Event>) -> AddressSet {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(Event::Update(set))) => return set,
                Ok(Some(Event::Error)) => continue,
                other => panic!("expected an address update, got {}", other.is_ok()),
            }
        }
    }

    fn ip() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    #[test]
    fn test_address_set_dedupes_and_sorts() {
        let set = AddressSet::new([
            Address { addr: "b:1".into(), version: "1".into() },
            Address { addr: "a:1".into(), version: "1".into() },
            Address { addr: "b:1".into(), version: "2".into() },
        ]);
        assert_eq!(set.addrs(), vec!["a:1", "b:1"]);
        assert!(set.contains("b:1"));
    }

    #[test]
    fn test_config_validation() {
        assert!(ResolverConfig::default().validate().is_ok());
        assert!(ResolverConfig::default().with_max_attempts(0).validate().is_err());
        assert!(ResolverConfig::default()
            .with_refresh_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_initial_resolution_pushes_full_set() {
        let store = Arc::new(FlakyStore::new());
        let registry = Registry::new(store.clone());
        registry.service("orders").register(ip(), 9001, ServiceKind::Rpc, "1").await.unwrap();
        registry.service("orders").register(ip(), 9002, ServiceKind::Rpc, "1").await.unwrap();

        let shutdown = Shutdown::new();
        let (_registry, _resolver, mut rx) = start(store, fast_config(), &shutdown);

        let set = next_update(&mut rx).await;
        assert_eq!(set.addrs(), vec!["10.0.0.5:9001", "10.0.0.5:9002"]);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_watch_update_replaces_set() {
        let store = Arc::new(FlakyStore::new());
        let shutdown = Shutdown::new();
        let (registry, _resolver, mut rx) = start(store, fast_config(), &shutdown);
        let orders = registry.service("orders");

        let old = orders.register(ip(), 9001, ServiceKind::Rpc, "1").await.unwrap();
        let mut set = next_update(&mut rx).await;
        while !set.contains("10.0.0.5:9001") {
            set = next_update(&mut rx).await;
        }

        orders.deregister(&old.sequence).await.unwrap();
        orders.register(ip(), 9002, ServiceKind::Rpc, "1").await.unwrap();

        let mut set = next_update(&mut rx).await;
        while !set.contains("10.0.0.5:9002") {
            set = next_update(&mut rx).await;
        }
        assert_eq!(set.addrs(), vec!["10.0.0.5:9002"]);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_failure_reports_after_three_attempts() {
        let store = Arc::new(FlakyStore::new());
        store.offline.store(true, Ordering::SeqCst);
        let shutdown = Shutdown::new();
        let (_registry, _resolver, mut rx) = start(store.clone(), fast_config(), &shutdown);

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Event::Error)) => {}
            _ => panic!("expected an error report"),
        }
        assert_eq!(store.lists.load(Ordering::SeqCst), 3);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_triggers_during_quiet_period_coalesce() {
        let store = Arc::new(FlakyStore::new());
        let shutdown = Shutdown::new();
        let config = fast_config().with_min_interval(Duration::from_millis(300));
        let (_registry, resolver, mut rx) = start(store.clone(), config, &shutdown);

        next_update(&mut rx).await;
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            resolver.resolve_now();
        }
        tokio::time::sleep(Duration::from_millis(700)).await;

        // One follow-up resolution, not ten.
        assert_eq!(store.lists.load(Ordering::SeqCst), 2);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_close_stops_background_tasks() {
        let store = Arc::new(FlakyStore::new());
        let shutdown = Shutdown::new();
        let (_registry, resolver, mut rx) = start(store, fast_config(), &shutdown);
        next_update(&mut rx).await;

        resolver.close();
        tokio::time::timeout(Duration::from_secs(1), resolver.closed())
            .await
            .expect("resolver tasks should exit");
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_process_shutdown_stops_resolver() {
        let store = Arc::new(FlakyStore::new());
        let shutdown = Shutdown::new();
        let (_registry, resolver, _rx) = start(store, fast_config(), &shutdown);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), resolver.closed())
            .await
            .expect("resolver tasks should exit");
    }
}
