use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

pub type RequestId = u64;
pub type MethodName = String;
pub type RpcArgs = serde_json::Value;

/// A single RPC invocation sent over a subchannel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: MethodName,
    pub args: RpcArgs,
    /// Deadline for the whole call, in milliseconds. `None` uses the channel default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Request {
    pub fn new(method: impl Into<String>, args: RpcArgs) -> Self {
        Self {
            id: next_request_id(),
            method: method.into(),
            args,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// The call deadline, falling back to `default` when none was set.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// Ids count up from a per-process base seeded by the start time, so two
/// processes talking to one server rarely collide.
fn next_request_id() -> RequestId {
    static BASE: OnceLock<u64> = OnceLock::new();
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let base = *BASE.get_or_init(|| {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() << 32)
            .unwrap_or(0)
    });
    base.wrapping_add(NEXT.fetch_add(1, Ordering::Relaxed))
}
