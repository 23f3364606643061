//! Process-wide cache of service channels.
//!
//! One [`Channel`] per service name is shared by every caller. A
//! [`Dialer`] opens channels on a miss; [`SchemeDialer`] is the one the
//! application context uses.

use std::sync::Arc;

use async_trait::async_trait;
use corral_common::{Result, Shutdown};
use dashmap::DashMap;

use crate::channel::{Channel, DialOptions};
use crate::scheme::SchemeRegistry;
use crate::target::Target;

/// Opens a new channel to a service.
///
/// The cache only ever calls this on a miss, under the per-name creation
/// lock.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a channel to `service_name`.
    ///
    /// # Errors
    ///
    /// Any dial failure. The cache passes it through unchanged and caches
    /// nothing.
    async fn dial(&self, service_name: &str) -> Result<Channel>;
}

/// Dials `<scheme>:///<service>` through a [`SchemeRegistry`].
///
/// # Fields
///
/// - `schemes`: Resolver and balancer per scheme
/// - `scheme`: Scheme used for bare service names
/// - `shutdown`: Parent of every dialed channel's shutdown
/// - `options`: Timeouts, retries and keepalive for new channels
pub struct SchemeDialer {
    schemes: Arc<SchemeRegistry>,
    scheme: String,
    shutdown: Shutdown,
    options: DialOptions,
}

impl SchemeDialer {
    pub fn new(schemes: Arc<SchemeRegistry>, scheme: impl Into<String>, shutdown: Shutdown, options: DialOptions) -> Self {
        Self {
            schemes,
            scheme: scheme.into(),
            shutdown,
            options,
        }
    }

    /// Dials `target` directly, bypassing any cache.
    ///
    /// # Errors
    ///
    /// - [`CorralError::UnknownScheme`](corral_common::CorralError::UnknownScheme)
    ///   if `target.scheme` is not registered
    /// - Whatever [`Channel::dial`] returns
    pub async fn dial_target(&self, target: Target) -> Result<Channel> {
        let entry = self.schemes.get(&target.scheme)?;
        Channel::dial(
            target,
            entry.resolver.as_ref(),
            entry.balancer,
            &self.shutdown,
            self.options.clone(),
        )
        .await
    }
}

#[async_trait]
impl Dialer for SchemeDialer {
    async fn dial(&self, service_name: &str) -> Result<Channel> {
        self.dial_target(Target::new(self.scheme.clone(), service_name)).await
    }
}

/// Process-wide map from service name to its shared [`Channel`].
///
/// # Concurrency
///
/// Lookups are lock-free reads on a [`DashMap`]. A miss takes a per-name
/// creation lock and checks the map again before dialing, so concurrent
/// cold lookups for one service dial exactly once and all get the same
/// handle. Lookups for different services never wait on each other.
///
/// A cached channel whose state is neither `Ready` nor `Idle` is evicted on
/// lookup and closed; the lookup then dials a replacement.
///
/// # Fields
///
/// - `conns`: Live channels by service name
/// - `creation_locks`: One async mutex per service name ever dialed
/// - `dialer`: Opens channels on a miss
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use corral_client::{ConnectionCache, Dialer};
///
/// # async fn example(dialer: Arc<dyn Dialer>) -> corral_common::Result<()> {
/// let cache = ConnectionCache::new(dialer);
///
/// let orders = cache.get("orders").await?;
/// let again = cache.get("orders").await?;
/// assert!(orders.ptr_eq(&again));
///
/// cache.close_all().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionCache {
    conns: DashMap<String, Channel>,
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    dialer: Arc<dyn Dialer>,
}

impl ConnectionCache {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            conns: DashMap::new(),
            creation_locks: DashMap::new(),
            dialer,
        }
    }

    /// Returns the cached channel for `service_name`, dialing on a miss.
    ///
    /// # Implementation Details
    ///
    /// - Fast path: a usable cached channel is returned without locking
    /// - A dead cached channel is evicted and closed first
    /// - On a miss the per-name creation lock is taken and the map checked
    ///   again, so only the first waiter dials
    ///
    /// # Errors
    ///
    /// Whatever the dialer returns. Nothing is cached on failure.
    pub async fn get(&self, service_name: &str) -> Result<Channel> {
        if let Some(channel) = self.lookup(service_name).await {
            return Ok(channel);
        }

        let lock = self
            .creation_locks
            .entry(service_name.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Another task may have dialed while we waited.
        if let Some(channel) = self.lookup(service_name).await {
            return Ok(channel);
        }

        tracing::debug!(service = service_name, "dialing service");
        let channel = self.dialer.dial(service_name).await?;
        self.conns.insert(service_name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Returns a usable cached channel, evicting it first if it is dead.
    async fn lookup(&self, service_name: &str) -> Option<Channel> {
        let channel = self.conns.get(service_name).map(|entry| entry.value().clone())?;
        let state = channel.state();
        if state.is_usable() {
            return Some(channel);
        }

        // Only evict the exact channel we saw; a replacement may already be in.
        let evicted = self
            .conns
            .remove_if(service_name, |_, cached| cached.ptr_eq(&channel))
            .is_some();
        if evicted {
            tracing::info!(service = service_name, state = %state, "evicting dead channel");
            channel.close().await;
        }
        None
    }

    /// Drops and closes the cached channel for `service_name`, if any.
    ///
    /// # Returns
    ///
    /// `true` if a channel was cached under that name.
    pub async fn remove(&self, service_name: &str) -> bool {
        match self.conns.remove(service_name) {
            Some((_, channel)) => {
                channel.close().await;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.conns.contains_key(service_name)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Closes every cached channel and empties the cache.
    ///
    /// Creation locks are kept: a `get` already waiting on one must still
    /// serialize with lookups that start after this returns.
    pub async fn close_all(&self) {
        let names: Vec<String> = self.conns.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.remove(&name).await;
        }
    }
}
