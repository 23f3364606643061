//! Client side of corral: resolve a service name through the registry,
//! balance calls across its instances and share one channel per service.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use corral_client::{AppContext, ClientConfig};
//! use corral_common::Shutdown;
//! use corral_registry::{EtcdConfig, EtcdStore, Registry};
//! use serde_json::json;
//!
//! # async fn example() -> corral_common::Result<()> {
//! let store = EtcdStore::new(EtcdConfig::from_env())?;
//! let ctx = AppContext::new(Registry::new(Arc::new(store)), ClientConfig::default(), Shutdown::new())?;
//!
//! let orders = ctx.connection("orders").await?;
//! let reply = orders.call("get_order", json!({ "id": 7 })).await?;
//! println!("{}", reply);
//!
//! ctx.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod conn_cache;
pub mod context;
pub mod picker;
pub mod resolver;
pub mod scheme;
pub mod subchannel;
pub mod target;

pub use channel::{Channel, DialOptions, DEFAULT_KEEPALIVE};
pub use conn_cache::{ConnectionCache, Dialer, SchemeDialer};
pub use context::{AppContext, ClientConfig, DEFAULT_SCHEME};
pub use picker::{Balancer, Picker, RoundRobin, RoundRobinBalancer};
pub use resolver::{
    resolve_addresses, Address, AddressSet, RegistryResolver, RegistryResolverBuilder, Resolver, ResolverBuilder,
    ResolverConfig, ResolverSink,
};
pub use scheme::{SchemeEntry, SchemeRegistry};
pub use subchannel::{ConnectivityState, Subchannel};
pub use target::Target;
