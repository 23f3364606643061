use std::fmt;
use std::str::FromStr;

use corral_common::{CorralError, Result};

/// A logical dial target, `<scheme>://<authority>/<endpoint>`.
///
/// Corral targets leave the authority empty: `corral:///orders` names the
/// `orders` service resolved by whatever is registered for `corral`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    pub fn new(scheme: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority: String::new(),
            endpoint: service_name.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |why: &str| CorralError::InvalidTarget(format!("'{}': {}", raw, why));

        let (scheme, rest) = raw.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("invalid scheme"));
        }

        let (authority, endpoint) = rest.split_once('/').ok_or_else(|| invalid("missing endpoint"))?;
        if endpoint.is_empty() {
            return Err(invalid("empty endpoint"));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    /// The logical service name.
    pub fn service_name(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

impl FromStr for Target {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
