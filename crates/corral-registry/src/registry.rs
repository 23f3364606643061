//! Typed service registry over a [`KvStore`].
//!
//! Every instance of a service owns one record under
//! `/<SERVICE_PREFIX>.<service>.<cluster>/<sequence>`, holding its address as
//! JSON. Records are created create-only at startup and deleted on shutdown.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use corral_common::{CorralError, Result, Shutdown};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::store::{KeyValue, KvStore};
use crate::watch::run_watch;

/// First path segment of every registry key.
pub const SERVICE_PREFIX: &str = "corral-service";

pub const DEFAULT_CLUSTER: &str = "load-balance";

/// Range a port is drawn from when an instance registers without one.
pub const RANDOM_PORT_RANGE: std::ops::Range<u16> = 50000..60000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Rpc,
    Http,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Rpc => write!(f, "rpc"),
            ServiceKind::Http => write!(f, "http"),
        }
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rpc" => Ok(ServiceKind::Rpc),
            "http" => Ok(ServiceKind::Http),
            other => Err(format!("unknown service kind '{}'", other)),
        }
    }
}

/// The JSON payload stored for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    #[serde(default)]
    pub service_version: String,
    pub service_ip: String,
    pub service_port: String,
    #[serde(default)]
    pub service_kind: ServiceKind,
    #[serde(default)]
    pub last_modified: String,
}

impl EndpointRecord {
    pub fn new(ip: IpAddr, port: u16, kind: ServiceKind) -> Self {
        Self {
            service_version: String::new(),
            service_ip: ip.to_string(),
            service_port: port.to_string(),
            service_kind: kind,
            last_modified: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    /// `ip:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.service_ip.contains(':') {
            format!("[{}]:{}", self.service_ip, self.service_port)
        } else {
            format!("{}:{}", self.service_ip, self.service_port)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_port.trim().is_empty() {
            return Err(CorralError::InvalidRecord("service_port is empty".into()));
        }
        if self.service_ip.trim().is_empty() {
            return Err(CorralError::InvalidRecord("service_ip is empty".into()));
        }
        Ok(())
    }

    fn decode(raw: &str) -> Result<Self> {
        let record: Self = serde_json::from_str(raw)
            .map_err(|e| CorralError::InvalidRecord(format!("malformed record: {}", e)))?;
        record.validate()?;
        Ok(record)
    }
}

/// Builds `/<prefix>.<service>.<cluster>[/<sequence>...]`.
pub fn key_name(service_name: &str, cluster: &str, sequences: &[&str]) -> String {
    let mut key = format!("/{}.{}.{}", SERVICE_PREFIX, service_name, cluster);
    for sequence in sequences {
        key.push('/');
        key.push_str(sequence);
    }
    key
}

/// Sequence of an instance: the numeric form of its IP followed by the
/// zero-padded port, so one host:port always maps to one key.
pub fn sequence_for(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}{:05}", u32::from(v4), port),
        IpAddr::V6(v6) => format!("{}{:05}", u128::from(v6), port),
    }
}

pub fn random_port() -> u16 {
    rand::thread_rng().gen_range(RANDOM_PORT_RANGE)
}

fn decode_entries<'a>(
    entries: impl IntoIterator<Item = &'a KeyValue>,
    key_of: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, EndpointRecord> {
    let mut records = BTreeMap::new();
    for entry in entries {
        let Some(name) = key_of(&entry.key) else {
            continue;
        };
        match EndpointRecord::decode(&entry.value) {
            Ok(record) => {
                records.insert(name, record);
            }
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "skipping invalid registry record"),
        }
    }
    records
}

/// Registry client shared by a whole process.
///
/// Constructed once around a store and handed down to resolvers and the
/// application context.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
    cluster: String,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            cluster: DEFAULT_CLUSTER.to_string(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// View of the registry scoped to one service.
    pub fn service(&self, service_name: impl Into<String>) -> ServiceRegistry {
        ServiceRegistry {
            store: self.store.clone(),
            service_name: service_name.into(),
            cluster: self.cluster.clone(),
        }
    }

    pub async fn get_configs(&self, service_name: &str) -> Result<BTreeMap<String, EndpointRecord>> {
        self.service(service_name).get_configs().await
    }

    /// Every record of every service, keyed by full registry key.
    pub async fn list_configs(&self) -> Result<BTreeMap<String, EndpointRecord>> {
        let entries = match self.store.list("/").await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let prefix = format!("/{}.", SERVICE_PREFIX);
        Ok(decode_entries(&entries, |key| {
            key.starts_with(&prefix).then(|| key.to_string())
        }))
    }

    /// `ip:port` of every registered instance of `service_name`.
    pub async fn endpoints(&self, service_name: &str) -> Result<Vec<String>> {
        Ok(self
            .get_configs(service_name)
            .await?
            .values()
            .map(EndpointRecord::address)
            .collect())
    }
}

/// Registry operations for one service name.
#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn KvStore>,
    service_name: String,
    cluster: String,
}

/// Outcome of [`ServiceRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub sequence: String,
    pub record: EndpointRecord,
}

impl ServiceRegistry {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Directory holding all records of this service.
    pub fn prefix(&self) -> String {
        key_name(&self.service_name, &self.cluster, &[])
    }

    pub fn key_name(&self, sequences: &[&str]) -> String {
        key_name(&self.service_name, &self.cluster, sequences)
    }

    /// Creates the record for `sequence`. Never overwrites.
    ///
    /// # Errors
    ///
    /// - [`CorralError::Conflict`] if the sequence is already registered
    /// - [`CorralError::TransientInfra`] if the store is unreachable
    pub async fn write_config(&self, sequence: &str, record: &EndpointRecord) -> Result<()> {
        record.validate()?;
        let key = self.key_name(&[sequence]);
        let value = serde_json::to_string(record)?;
        self.store.create(&key, value).await
    }

    pub async fn get_config(&self, sequence: &str) -> Result<EndpointRecord> {
        let key = self.key_name(&[sequence]);
        let entry = self.store.get(&key).await?;
        EndpointRecord::decode(&entry.value)
    }

    /// Deletes the record for `sequence`. A missing record is not an error.
    pub async fn clear_config(&self, sequence: &str) -> Result<()> {
        let key = self.key_name(&[sequence]);
        match self.store.delete(&key).await {
            Err(e) if e.is_not_found() => {
                tracing::debug!(key = %key, "record already absent");
                Ok(())
            }
            other => other,
        }
    }

    /// All records of this service, keyed by sequence. An unknown service has none.
    ///
    /// Malformed records are logged and skipped.
    pub async fn get_configs(&self) -> Result<BTreeMap<String, EndpointRecord>> {
        let prefix = self.prefix();
        let entries = match self.store.list(&prefix).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let dir = format!("{}/", prefix);
        Ok(decode_entries(&entries, |key| {
            key.strip_prefix(&dir).map(str::to_string)
        }))
    }

    /// Starts the watch loop on this service's prefix.
    ///
    /// Each mutation calls `wake.notify_one()`. `Notify` stores at most one
    /// permit, so a slow consumer sees a single coalesced wake-up. The loop
    /// ends when `shutdown` fires.
    pub fn watch(&self, shutdown: Shutdown, wake: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(run_watch(self.store.clone(), self.prefix(), shutdown, wake))
    }

    /// Registers this process as an instance at `ip:port`.
    ///
    /// A `port` of `0` picks one from [`RANDOM_PORT_RANGE`].
    pub async fn register(
        &self,
        ip: IpAddr,
        port: u16,
        kind: ServiceKind,
        version: &str,
    ) -> Result<Registration> {
        let port = if port == 0 { random_port() } else { port };
        let sequence = sequence_for(ip, port);
        let record = EndpointRecord::new(ip, port, kind).with_version(version);

        self.write_config(&sequence, &record).await?;
        tracing::info!(
            service = %self.service_name,
            sequence = %sequence,
            addr = %record.address(),
            "registered service instance"
        );

        Ok(Registration { sequence, record })
    }

    pub async fn deregister(&self, sequence: &str) -> Result<()> {
        self.clear_config(sequence).await?;
        tracing::info!(service = %self.service_name, sequence = %sequence, "deregistered service instance");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::net::Ipv4Addr;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_key_name() {
        assert_eq!(
            key_name("orders", DEFAULT_CLUSTER, &[]),
            "/corral-service.orders.load-balance"
        );
        assert_eq!(
            key_name("orders", "blue", &["1", "2"]),
            "/corral-service.orders.blue/1/2"
        );
    }

    #[test]
    fn test_sequence_is_stable_and_distinct() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(sequence_for(ip, 9001), "16777216509001");
        assert_eq!(sequence_for(ip, 9001), sequence_for(ip, 9001));
        assert_ne!(sequence_for(ip, 9001), sequence_for(ip, 9002));
        assert_ne!(
            sequence_for(ip, 9001),
            sequence_for(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)), 9001)
        );
    }

    #[test]
    fn test_record_json_layout() {
        let record = EndpointRecord::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 9001, ServiceKind::Rpc)
            .with_version("1.2.0");
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["service_ip"], "10.0.0.5");
        assert_eq!(json["service_port"], "9001");
        assert_eq!(json["service_kind"], "rpc");
        assert_eq!(json["service_version"], "1.2.0");
        assert!(json["last_modified"].as_str().unwrap().contains('T'));
        assert_eq!(record.address(), "10.0.0.5:9001");
    }

    #[test]
    fn test_ipv6_address_is_bracketed() {
        let record = EndpointRecord::new("::1".parse().unwrap(), 80, ServiceKind::Http);
        assert_eq!(record.address(), "[::1]:80");
    }

    #[test]
    fn test_random_port_range() {
        for _ in 0..100 {
            assert!(RANDOM_PORT_RANGE.contains(&random_port()));
        }
    }

    #[tokio::test]
    async fn test_write_is_create_only() {
        let orders = registry().service("orders");
        let first = EndpointRecord::new("10.0.0.5".parse().unwrap(), 9001, ServiceKind::Rpc);
        let second = first.clone().with_version("other");

        orders.write_config("1", &first).await.unwrap();
        let err = orders.write_config("1", &second).await.unwrap_err();
        assert!(matches!(err, CorralError::Conflict(_)));
        assert_eq!(orders.get_config("1").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let orders = registry().service("orders");
        orders.clear_config("missing").await.unwrap();

        let record = EndpointRecord::new("10.0.0.5".parse().unwrap(), 9001, ServiceKind::Rpc);
        orders.write_config("1", &record).await.unwrap();
        orders.clear_config("1").await.unwrap();
        orders.clear_config("1").await.unwrap();
        assert!(orders.get_config("1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_port_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let orders = Registry::new(store.clone()).service("orders");
        store
            .create(
                &orders.key_name(&["1"]),
                r#"{"service_ip":"10.0.0.5","service_port":""}"#.into(),
            )
            .await
            .unwrap();

        assert!(matches!(
            orders.get_config("1").await,
            Err(CorralError::InvalidRecord(_))
        ));
        assert!(orders.get_configs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_configs_scopes_to_service() {
        let registry = registry();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        registry.service("orders").register(ip, 9001, ServiceKind::Rpc, "1").await.unwrap();
        registry.service("orders").register(ip, 9002, ServiceKind::Rpc, "1").await.unwrap();
        registry.service("payments").register(ip, 9100, ServiceKind::Http, "1").await.unwrap();

        let orders = registry.get_configs("orders").await.unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.contains_key(&sequence_for(ip, 9001)));

        assert_eq!(
            registry.endpoints("orders").await.unwrap(),
            vec!["10.0.0.5:9001".to_string(), "10.0.0.5:9002".to_string()]
        );
        assert!(registry.get_configs("unknown").await.unwrap().is_empty());

        let all = registry.list_configs().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.keys().all(|k| k.starts_with("/corral-service.")));
    }

    #[tokio::test]
    async fn test_register_random_port() {
        let orders = registry().service("orders");
        let registration = orders
            .register("10.0.0.5".parse().unwrap(), 0, ServiceKind::Rpc, "1")
            .await
            .unwrap();
        let port: u16 = registration.record.service_port.parse().unwrap();
        assert!(RANDOM_PORT_RANGE.contains(&port));
        assert_eq!(
            orders.get_config(&registration.sequence).await.unwrap(),
            registration.record
        );
    }
}
