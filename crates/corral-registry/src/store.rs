//! Key-value store abstraction the registry is built on.
//!
//! Keys are `/`-separated paths. A store keeps a monotonically increasing
//! modification index and can block until the next change under a prefix,
//! which is what the registry watch long-polls on.

use async_trait::async_trait;
use corral_common::Result;

/// A leaf key with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub modified_index: u64,
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Create,
    Set,
    Update,
    Delete,
    Expire,
    CompareAndSwap,
    CompareAndDelete,
    Get,
    Other(String),
}

impl WatchAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "create" => WatchAction::Create,
            "set" => WatchAction::Set,
            "update" => WatchAction::Update,
            "delete" => WatchAction::Delete,
            "expire" => WatchAction::Expire,
            "compareAndSwap" => WatchAction::CompareAndSwap,
            "compareAndDelete" => WatchAction::CompareAndDelete,
            "get" => WatchAction::Get,
            other => WatchAction::Other(other.to_string()),
        }
    }

    /// Everything except a read changes what the resolver would see.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, WatchAction::Get)
    }
}

/// One change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    pub index: u64,
}

/// Operations the registry needs from a distributed store.
///
/// Errors follow the registry taxonomy: a missing key is
/// [`CorralError::NotFound`](corral_common::CorralError::NotFound), an
/// occupied key on create is `Conflict`, and connectivity problems are
/// `TransientInfra`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Writes `value` only if `key` does not exist yet.
    async fn create(&self, key: &str, value: String) -> Result<()>;

    async fn get(&self, key: &str) -> Result<KeyValue>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All leaf keys under `prefix`, recursively. `NotFound` if the prefix
    /// holds nothing at all.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Blocks until an event under `prefix` with index at or after
    /// `wait_index` exists, and returns it. `None` waits for the next change.
    async fn watch(&self, prefix: &str, wait_index: Option<u64>) -> Result<WatchEvent>;
}

/// Whether `key` lies at or below the directory `prefix`.
pub fn is_under(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
