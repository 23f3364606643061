//! Logical connection to a service.
//!
//! A [`Channel`] is what the connection cache hands out. It owns a resolver
//! for its target, one [`Subchannel`] per resolved address, and the picker
//! built from whichever subchannels are ready.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use corral_common::{CorralError, Request, Result, Shutdown};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;

use crate::picker::{Balancer, Picker};
use crate::resolver::{AddressSet, Resolver, ResolverBuilder, ResolverSink};
use crate::subchannel::{ConnectivityState, Subchannel};
use crate::target::Target;

/// Idle time before keepalive checks start on a connection.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(6 * 60);

/// Per-channel timeouts and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    /// Budget for one TCP connect.
    pub connect_timeout: Duration,
    /// How long a dial waits for the first resolution.
    pub dial_timeout: Duration,
    /// Default deadline of a call without its own timeout.
    pub call_timeout: Duration,
    /// Attempts per call on retryable failures, each on a fresh pick.
    pub call_attempts: u32,
    /// Idle time before TCP keepalive checks start on a subchannel's
    /// connection. `None` disables keepalive.
    pub keepalive: Option<Duration>,
}

impl DialOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_call_attempts(mut self, attempts: u32) -> Self {
        self.call_attempts = attempts;
        self
    }

    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = idle;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.keepalive.is_some_and(|idle| idle < Duration::from_secs(1)) {
            return Err("keepalive must be at least 1s".into());
        }
        if self.connect_timeout.is_zero() || self.dial_timeout.is_zero() || self.call_timeout.is_zero() {
            return Err("timeouts must be greater than 0".into());
        }
        if self.call_attempts == 0 {
            return Err("call_attempts must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            call_attempts: 2,
            keepalive: Some(DEFAULT_KEEPALIVE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Pending,
    Resolved,
    Failed(String),
}

/// Aggregate connectivity of a set of subchannels.
pub fn aggregate_state(states: impl IntoIterator<Item = ConnectivityState>) -> ConnectivityState {
    let mut any = false;
    let mut connecting = false;
    let mut idle = false;

    for state in states {
        any = true;
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => connecting = true,
            ConnectivityState::Idle => idle = true,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {}
        }
    }

    if connecting {
        ConnectivityState::Connecting
    } else if !any || idle {
        ConnectivityState::Idle
    } else {
        ConnectivityState::TransientFailure
    }
}

struct ChannelInner {
    target: Target,
    options: DialOptions,
    balancer: Arc<dyn Balancer>,
    subchannels: Mutex<BTreeMap<String, Arc<Subchannel>>>,
    picker: RwLock<Arc<dyn Picker>>,
    addresses: RwLock<AddressSet>,
    resolution: watch::Sender<Resolution>,
    resolver: OnceLock<Box<dyn Resolver>>,
    last_error: Mutex<Option<String>>,
    /// Serializes subchannel reconciliation and reconnects.
    update_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn state(&self) -> ConnectivityState {
        if self.is_closed() {
            return ConnectivityState::Shutdown;
        }
        aggregate_state(self.subchannels.lock().values().map(|s| s.state()))
    }

    /// Swaps in a picker over the currently ready subchannels.
    fn rebuild_picker(&self) {
        let ready: Vec<Arc<Subchannel>> = if self.is_closed() {
            Vec::new()
        } else {
            self.subchannels
                .lock()
                .values()
                .filter(|s| s.state() == ConnectivityState::Ready)
                .cloned()
                .collect()
        };
        let picker = self.balancer.build_picker(ready);
        *self.picker.write() = picker;
    }

    async fn apply_addresses(&self, addresses: AddressSet) {
        if self.is_closed() {
            return;
        }
        let _guard = self.update_lock.lock().await;

        let (removed, pending) = {
            let mut subchannels = self.subchannels.lock();
            let wanted: HashSet<&str> = addresses.iter().map(|a| a.addr.as_str()).collect();

            let stale: Vec<String> = subchannels
                .keys()
                .filter(|addr| !wanted.contains(addr.as_str()))
                .cloned()
                .collect();
            let removed: Vec<Arc<Subchannel>> = stale.iter().filter_map(|addr| subchannels.remove(addr)).collect();

            for address in addresses.iter() {
                subchannels
                    .entry(address.addr.clone())
                    .or_insert_with(|| {
                        Arc::new(
                            Subchannel::new(address.addr.clone(), self.options.connect_timeout)
                                .with_keepalive(self.options.keepalive),
                        )
                    });
            }

            let pending: Vec<Arc<Subchannel>> = subchannels
                .values()
                .filter(|s| s.state() != ConnectivityState::Ready)
                .cloned()
                .collect();
            (removed, pending)
        };

        tracing::debug!(
            channel = %self.target,
            addresses = addresses.len(),
            removed = removed.len(),
            connecting = pending.len(),
            "applying address update"
        );
        *self.addresses.write() = addresses;
        // Stale subchannels leave the picker before anything else happens.
        self.rebuild_picker();

        for subchannel in removed {
            subchannel.shutdown().await;
        }
        join_all(pending.iter().map(|s| s.connect())).await;
        self.rebuild_picker();

        self.resolution.send_if_modified(|status| {
            if *status == Resolution::Resolved {
                return false;
            }
            *status = Resolution::Resolved;
            true
        });
    }

    fn report_error(&self, error: CorralError) {
        tracing::warn!(channel = %self.target, error = %error, "resolver reported error");
        let message = error.to_string();
        *self.last_error.lock() = Some(message.clone());
        self.resolution.send_if_modified(|status| {
            if *status != Resolution::Pending {
                return false;
            }
            *status = Resolution::Failed(message);
            true
        });
    }

    /// Retries every idle or failed subchannel once.
    async fn reconnect(&self) {
        if self.is_closed() {
            return;
        }
        let _guard = self.update_lock.lock().await;

        let pending: Vec<Arc<Subchannel>> = self
            .subchannels
            .lock()
            .values()
            .filter(|s| matches!(s.state(), ConnectivityState::Idle | ConnectivityState::TransientFailure))
            .cloned()
            .collect();
        if pending.is_empty() {
            return;
        }

        join_all(pending.iter().map(|s| s.connect())).await;
        self.rebuild_picker();
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(resolver) = self.resolver.get() {
            resolver.close();
        }
    }
}

/// Forwards resolver output to a channel without keeping it alive.
struct ChannelSink {
    inner: Weak<ChannelInner>,
}

#[async_trait]
impl ResolverSink for ChannelSink {
    async fn update_addresses(&self, addresses: AddressSet) {
        if let Some(inner) = self.inner.upgrade() {
            inner.apply_addresses(addresses).await;
        }
    }

    fn report_error(&self, error: CorralError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.report_error(error);
        }
    }
}

/// A load-balanced connection to every instance of one service.
///
/// Cloning is cheap and yields a handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Starts resolution for `target` and waits for its first outcome.
    ///
    /// # Errors
    ///
    /// - [`CorralError::TransientInfra`] if the first resolution failed
    /// - [`CorralError::Timeout`] if nothing resolved within `dial_timeout`
    /// - [`CorralError::Shutdown`] if `shutdown` fired meanwhile
    pub async fn dial(
        target: Target,
        resolver: &dyn ResolverBuilder,
        balancer: Arc<dyn Balancer>,
        shutdown: &Shutdown,
        options: DialOptions,
    ) -> Result<Self> {
        options.validate().map_err(CorralError::InvalidConfig)?;
        if shutdown.is_triggered() {
            return Err(CorralError::Shutdown);
        }

        let (resolution, _) = watch::channel(Resolution::Pending);
        let picker = balancer.build_picker(Vec::new());
        let inner = Arc::new(ChannelInner {
            target,
            balancer,
            subchannels: Mutex::new(BTreeMap::new()),
            picker: RwLock::new(picker),
            addresses: RwLock::new(AddressSet::default()),
            resolution,
            resolver: OnceLock::new(),
            last_error: Mutex::new(None),
            update_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            options,
        });

        let sink = Arc::new(ChannelSink {
            inner: Arc::downgrade(&inner),
        });
        let built = resolver.build(&inner.target, sink, shutdown)?;
        // The cell is fresh, so this cannot already be set.
        let _ = inner.resolver.set(built);

        let channel = Channel { inner };
        match channel.wait_first_resolution(shutdown).await {
            Ok(()) => {
                tracing::debug!(channel = %channel.inner.target, state = %channel.state(), "channel dialed");
                Ok(channel)
            }
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    async fn wait_first_resolution(&self, shutdown: &Shutdown) -> Result<()> {
        let mut rx = self.inner.resolution.subscribe();
        let wait = async {
            loop {
                let status = rx.borrow_and_update().clone();
                match status {
                    Resolution::Pending => {}
                    Resolution::Resolved => return Ok(()),
                    Resolution::Failed(message) => return Err(CorralError::TransientInfra(message)),
                }
                if rx.changed().await.is_err() {
                    return Err(CorralError::Shutdown);
                }
            }
        };

        let timeout = self.inner.options.dial_timeout;
        tokio::select! {
            _ = shutdown.wait() => Err(CorralError::Shutdown),
            waited = tokio::time::timeout(timeout, wait) => {
                waited.unwrap_or(Err(CorralError::Timeout(timeout.as_millis() as u64)))
            }
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.state()
    }

    /// Last address set pushed by the resolver.
    pub fn addresses(&self) -> AddressSet {
        self.inner.addresses.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Whether both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn resolve_now(&self) {
        if let Some(resolver) = self.inner.resolver.get() {
            resolver.resolve_now();
        }
    }

    /// Calls `method` on one instance of the service.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        self.invoke(Request::new(method, args)).await
    }

    /// Sends `request`, retrying retryable failures on a fresh pick.
    pub async fn invoke(&self, request: Request) -> Result<Value> {
        if self.inner.is_closed() {
            return Err(CorralError::Connection(format!("channel to {} is closed", self.inner.target)));
        }

        let timeout = request.timeout_or(self.inner.options.call_timeout);
        let attempts = self.inner.options.call_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let subchannel = match self.pick().await {
                Ok(subchannel) => subchannel,
                Err(e) => return Err(last_err.unwrap_or(e)),
            };

            match subchannel.call(&request, timeout).await {
                Ok(response) => return response.into_result(),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        channel = %self.inner.target,
                        addr = %subchannel.addr(),
                        attempt,
                        error = %e,
                        "call failed"
                    );
                    self.inner.rebuild_picker();
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| CorralError::Unavailable(self.inner.target.service_name().to_string())))
    }

    /// Picks a ready subchannel. With none ready, tries reconnecting known
    /// subchannels once; with none known, fails immediately.
    async fn pick(&self) -> Result<Arc<Subchannel>> {
        let picker = self.inner.picker.read().clone();
        if let Ok(subchannel) = picker.pick() {
            return Ok(subchannel);
        }

        // An address update may have been mid-flight; reconnect waits it out.
        self.inner.reconnect().await;
        let picker = self.inner.picker.read().clone();
        picker
            .pick()
            .map_err(|_| CorralError::Unavailable(self.inner.target.service_name().to_string()))
    }

    /// Stops the resolver and closes every subchannel.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(resolver) = self.inner.resolver.get() {
            resolver.close();
        }

        let subchannels: Vec<Arc<Subchannel>> = std::mem::take(&mut *self.inner.subchannels.lock())
            .into_values()
            .collect();
        for subchannel in subchannels {
            subchannel.shutdown().await;
        }
        self.inner.rebuild_picker();
        tracing::debug!(channel = %self.inner.target, "channel closed");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.target.to_string())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::RoundRobinBalancer;
    use crate::resolver::Address;
    use corral_common::transport::TcpServer;
    use corral_common::Response;
    use serde_json::json;

    /// Resolver fed by the test through a shared sink handle.
    struct StaticResolver;

    impl Resolver for StaticResolver {
        fn resolve_now(&self) {}
        fn close(&self) {}
    }

    struct StaticBuilder {
        initial: Option<AddressSet>,
        fail: bool,
        sink: Mutex<Option<Arc<dyn ResolverSink>>>,
    }

    impl StaticBuilder {
        fn with(addresses: &[&str]) -> Self {
            Self {
                initial: Some(set(addresses)),
                fail: false,
                sink: Mutex::new(None),
            }
        }

        fn sink(&self) -> Arc<dyn ResolverSink> {
            self.sink.lock().clone().unwrap()
        }
    }

    impl ResolverBuilder for StaticBuilder {
        fn build(&self, _target: &Target, sink: Arc<dyn ResolverSink>, _shutdown: &Shutdown) -> Result<Box<dyn Resolver>> {
            *self.sink.lock() = Some(sink.clone());
            let initial = self.initial.clone();
            let fail = self.fail;
            tokio::spawn(async move {
                if fail {
                    sink.report_error(CorralError::TransientInfra("registry down".into()));
                } else if let Some(addresses) = initial {
                    sink.update_addresses(addresses).await;
                }
            });
            Ok(Box::new(StaticResolver))
        }
    }

    fn set(addresses: &[&str]) -> AddressSet {
        AddressSet::new(addresses.iter().map(|addr| Address {
            addr: addr.to_string(),
            version: String::new(),
        }))
    }

    fn options() -> DialOptions {
        DialOptions::default()
            .with_connect_timeout(Duration::from_millis(300))
            .with_dial_timeout(Duration::from_millis(500))
            .with_call_timeout(Duration::from_secs(1))
    }

    async fn echo_server(name: &'static str, shutdown: Shutdown) -> String {
        let server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            server
                .run_with_handler(
                    move |request: Request| async move { Ok(Response::success(request.id, json!(name))) },
                    shutdown,
                )
                .await
        });
        addr
    }

    async fn dial(builder: &StaticBuilder, shutdown: &Shutdown) -> Result<Channel> {
        Channel::dial(
            Target::new("test", "orders"),
            builder,
            Arc::new(RoundRobinBalancer),
            shutdown,
            options(),
        )
        .await
    }

    #[test]
    fn test_aggregate_state() {
        use ConnectivityState::*;
        assert_eq!(aggregate_state([]), Idle);
        assert_eq!(aggregate_state([TransientFailure, Ready]), Ready);
        assert_eq!(aggregate_state([TransientFailure, Connecting]), Connecting);
        assert_eq!(aggregate_state([TransientFailure, Idle]), Idle);
        assert_eq!(aggregate_state([TransientFailure, TransientFailure]), TransientFailure);
    }

    #[test]
    fn test_dial_options_validation() {
        assert!(DialOptions::default().validate().is_ok());
        assert!(DialOptions::default().with_call_attempts(0).validate().is_err());
        assert!(DialOptions::default().with_dial_timeout(Duration::ZERO).validate().is_err());
        assert_eq!(DialOptions::default().keepalive, Some(DEFAULT_KEEPALIVE));
        assert!(DialOptions::default().with_keepalive(None).validate().is_ok());
        assert!(DialOptions::default()
            .with_keepalive(Some(Duration::from_millis(10)))
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_calls_round_robin_across_instances() {
        let shutdown = Shutdown::new();
        let a = echo_server("a", shutdown.clone()).await;
        let b = echo_server("b", shutdown.clone()).await;

        let builder = StaticBuilder::with(&[a.as_str(), b.as_str()]);
        let channel = dial(&builder, &shutdown).await.unwrap();
        assert_eq!(channel.state(), ConnectivityState::Ready);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(channel.call("whoami", json!(null)).await.unwrap());
        }
        assert_eq!(seen.iter().filter(|v| **v == json!("a")).count(), 2);
        assert_eq!(seen.iter().filter(|v| **v == json!("b")).count(), 2);

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_empty_resolution_is_idle_and_fails_fast() {
        let shutdown = Shutdown::new();
        let builder = StaticBuilder::with(&[]);
        let channel = dial(&builder, &shutdown).await.unwrap();
        assert_eq!(channel.state(), ConnectivityState::Idle);

        let started = tokio::time::Instant::now();
        let err = channel.call("echo", json!(null)).await.unwrap_err();
        assert!(matches!(err, CorralError::Unavailable(_)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_first_resolution_failure_fails_dial() {
        let shutdown = Shutdown::new();
        let builder = StaticBuilder {
            initial: None,
            fail: true,
            sink: Mutex::new(None),
        };
        let err = dial(&builder, &shutdown).await.unwrap_err();
        assert!(matches!(err, CorralError::TransientInfra(_)));
    }

    #[tokio::test]
    async fn test_dial_times_out_without_resolution() {
        let shutdown = Shutdown::new();
        let builder = StaticBuilder {
            initial: None,
            fail: false,
            sink: Mutex::new(None),
        };
        let err = dial(&builder, &shutdown).await.unwrap_err();
        assert!(matches!(err, CorralError::Timeout(500)));
    }

    #[tokio::test]
    async fn test_update_replaces_subchannels() {
        let shutdown = Shutdown::new();
        let a = echo_server("a", shutdown.clone()).await;
        let b = echo_server("b", shutdown.clone()).await;

        let builder = StaticBuilder::with(&[a.as_str()]);
        let channel = dial(&builder, &shutdown).await.unwrap();
        assert_eq!(channel.call("whoami", json!(null)).await.unwrap(), json!("a"));

        builder.sink().update_addresses(set(&[b.as_str()])).await;
        assert_eq!(channel.addresses().addrs(), vec![b.as_str()]);
        for _ in 0..3 {
            assert_eq!(channel.call("whoami", json!(null)).await.unwrap(), json!("b"));
        }

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_later_errors_keep_addresses() {
        let shutdown = Shutdown::new();
        let a = echo_server("a", shutdown.clone()).await;
        let builder = StaticBuilder::with(&[a.as_str()]);
        let channel = dial(&builder, &shutdown).await.unwrap();

        builder.sink().report_error(CorralError::TransientInfra("registry down".into()));
        assert!(channel.last_error().unwrap().contains("registry down"));
        assert_eq!(channel.addresses().addrs(), vec![a.as_str()]);
        assert_eq!(channel.call("whoami", json!(null)).await.unwrap(), json!("a"));

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_unreachable_instances_are_transient_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let shutdown = Shutdown::new();
        let builder = StaticBuilder::with(&[dead.as_str()]);
        let channel = dial(&builder, &shutdown).await.unwrap();
        assert_eq!(channel.state(), ConnectivityState::TransientFailure);
        assert!(channel.call("echo", json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_shutdown() {
        let shutdown = Shutdown::new();
        let builder = StaticBuilder::with(&[]);
        let channel = dial(&builder, &shutdown).await.unwrap();

        channel.close().await;
        assert_eq!(channel.state(), ConnectivityState::Shutdown);
        assert!(matches!(
            channel.call("echo", json!(null)).await,
            Err(CorralError::Connection(_))
        ));
    }
}
