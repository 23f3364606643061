use thiserror::Error;

/// Errors produced anywhere in the corral connection layer.
///
/// The registry, resolver, connection cache and admission controller all
/// report through this one enum so callers can tell the expected conditions
/// (`NotFound`, `Capacity`) apart from the ones that need surfacing
/// (`Conflict`, `TransientInfra`).
#[derive(Error, Debug)]
pub enum CorralError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    Conflict(String),

    #[error("Registry unavailable: {0}")]
    TransientInfra(String),

    #[error("Request rejected by admission control, please retry later")]
    Capacity,

    #[error("No ready endpoint for {0}")]
    Unavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("No resolver registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutting down")]
    Shutdown,
}

impl CorralError {
    /// Expected absence of a registry key. Cleanup paths ignore it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CorralError::NotFound(_))
    }

    /// The admission controller is saturated; callers apply their own backoff.
    pub fn is_capacity(&self) -> bool {
        matches!(self, CorralError::Capacity)
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// `Conflict` is never retryable: the caller has to pick another identity.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CorralError::TransientInfra(_)
                | CorralError::Unavailable(_)
                | CorralError::Connection(_)
                | CorralError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CorralError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct() {
        let err = CorralError::NotFound("/corral-service.orders.load-balance/1".into());
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert!(!CorralError::TransientInfra("down".into()).is_not_found());
    }

    #[test]
    fn test_conflict_is_not_retryable() {
        assert!(!CorralError::Conflict("key".into()).is_retryable());
        assert!(CorralError::TransientInfra("timeout".into()).is_retryable());
        assert!(CorralError::Timeout(100).is_retryable());
    }

    #[test]
    fn test_capacity_message() {
        let err = CorralError::Capacity;
        assert!(err.is_capacity());
        assert!(err.to_string().contains("retry later"));
    }
}
