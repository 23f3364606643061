//! Service registry for corral.
//!
//! Instances publish an [`EndpointRecord`] under a per-service key prefix in a
//! distributed key-value store; callers list and watch that prefix to learn
//! which instances are live.
//!
//! The store is abstracted by [`KvStore`]. [`EtcdStore`] speaks the etcd v2
//! keys API and [`MemoryStore`] keeps everything in process.
//!
//! # Example
//!
//! ```no_run
//! use corral_registry::{EtcdConfig, EtcdStore, Registry, ServiceKind};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> corral_common::Result<()> {
//! let store = EtcdStore::new(EtcdConfig::from_env())?;
//! let registry = Registry::new(Arc::new(store));
//!
//! let orders = registry.service("orders");
//! let registration = orders
//!     .register("10.0.0.5".parse().unwrap(), 9001, ServiceKind::Rpc, "1.0.0")
//!     .await?;
//! // ... serve ...
//! orders.deregister(&registration.sequence).await?;
//! # Ok(())
//! # }
//! ```

pub mod etcd;
pub mod memory;
pub mod registry;
pub mod store;
mod watch;

pub use etcd::{EtcdConfig, EtcdStore};
pub use memory::MemoryStore;
pub use registry::{
    key_name, sequence_for, EndpointRecord, Registration, Registry, ServiceKind, ServiceRegistry,
    DEFAULT_CLUSTER, SERVICE_PREFIX,
};
pub use store::{KeyValue, KvStore, WatchAction, WatchEvent};
