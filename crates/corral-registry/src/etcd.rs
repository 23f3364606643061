//! [`KvStore`] backed by the etcd v2 keys HTTP API.
//!
//! | operation | request |
//! |-----------|---------|
//! | create    | `PUT /v2/keys/<key>?prevExist=false` with form `value=` |
//! | get       | `GET /v2/keys/<key>` |
//! | delete    | `DELETE /v2/keys/<key>` |
//! | list      | `GET /v2/keys/<prefix>?recursive=true&sorted=true` |
//! | watch     | `GET /v2/keys/<prefix>?wait=true&recursive=true[&waitIndex=N]` |
//!
//! Endpoints are tried in order; a connection failure or a 5xx moves on to
//! the next one. Every request except watch carries a timeout.

use std::time::Duration;

use async_trait::async_trait;
use corral_common::{CorralError, Result};
use serde::Deserialize;

use crate::store::{KeyValue, KvStore, WatchAction, WatchEvent};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Environment variable holding comma-separated registry URLs.
pub const ENDPOINTS_ENV: &str = "CORRAL_REGISTRY_URLS";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const ERROR_KEY_NOT_FOUND: u32 = 100;
const ERROR_NODE_EXIST: u32 = 105;
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

/// Connection settings for [`EtcdStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub request_timeout: Duration,
}

impl EtcdConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Parses a comma-separated URL list, ignoring blanks.
    pub fn parse(urls: &str) -> Self {
        Self::new(
            urls.split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| url.trim_end_matches('/').to_string()),
        )
    }

    /// Reads [`ENDPOINTS_ENV`], falling back to [`DEFAULT_ENDPOINT`].
    pub fn from_env() -> Self {
        match std::env::var(ENDPOINTS_ENV) {
            Ok(urls) if !urls.trim().is_empty() => Self::parse(&urls),
            _ => Self::new([DEFAULT_ENDPOINT]),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.endpoints.is_empty() {
            return Err("at least one registry endpoint is required".into());
        }
        if let Some(bad) = self
            .endpoints
            .iter()
            .find(|url| !(url.starts_with("http://") || url.starts_with("https://")))
        {
            return Err(format!("registry endpoint '{}' must start with http:// or https://", bad));
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".into());
        }
        Ok(())
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self::new([DEFAULT_ENDPOINT])
    }
}

#[derive(Debug, Deserialize)]
struct V2Response {
    action: String,
    #[serde(default)]
    node: Option<V2Node>,
}

#[derive(Debug, Deserialize)]
struct V2Node {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<V2Node>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct V2Error {
    #[serde(rename = "errorCode")]
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

fn collect_leaves(node: V2Node, out: &mut Vec<KeyValue>) {
    if node.dir {
        for child in node.nodes {
            collect_leaves(child, out);
        }
    } else if let (Some(key), Some(value)) = (node.key, node.value) {
        out.push(KeyValue {
            key,
            value,
            modified_index: node.modified_index,
        });
    }
}

/// Response from the endpoint that answered, and whether an endpoint tried
/// before it may have applied the request anyway.
struct Sent {
    response: reqwest::Response,
    maybe_applied: bool,
}

/// etcd v2 client.
pub struct EtcdStore {
    client: reqwest::Client,
    config: EtcdConfig,
}

impl EtcdStore {
    pub fn new(config: EtcdConfig) -> Result<Self> {
        config.validate().map_err(CorralError::InvalidConfig)?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CorralError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &EtcdConfig {
        &self.config
    }

    fn key_url(endpoint: &str, key: &str) -> String {
        let key = key.trim_start_matches('/');
        format!("{}/v2/keys/{}", endpoint.trim_end_matches('/'), key)
    }

    /// Sends the request built by `build` to each endpoint until one answers
    /// without a connection error or a 5xx.
    async fn send<F>(&self, build: F, timeout: Option<Duration>) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        self.send_tracked(build, timeout).await.map(|sent| sent.response)
    }

    async fn send_tracked<F>(&self, build: F, timeout: Option<Duration>) -> Result<Sent>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut last_err = String::from("no endpoints configured");
        let mut maybe_applied = false;

        for endpoint in &self.config.endpoints {
            let mut request = build(endpoint);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    tracing::debug!(endpoint = %endpoint, status = %response.status(), "registry endpoint returned server error");
                    last_err = format!("{} returned {}", endpoint, response.status());
                    maybe_applied = true;
                }
                Ok(response) => {
                    return Ok(Sent {
                        response,
                        maybe_applied,
                    })
                }
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "registry endpoint unreachable");
                    last_err = if e.is_timeout() {
                        maybe_applied = true;
                        format!("{} timed out", endpoint)
                    } else {
                        format!("{}: {}", endpoint, e)
                    };
                }
            }
        }

        Err(CorralError::TransientInfra(last_err))
    }

    /// Maps an etcd response body to either the decoded payload or the
    /// matching registry error.
    async fn decode(response: reqwest::Response, key: &str) -> Result<Option<V2Response>> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CorralError::TransientInfra(format!("failed to read registry response: {}", e)))?;

        if status.is_success() {
            // A long-poll watch can end with an empty body when etcd times it out.
            if body.trim().is_empty() {
                return Ok(None);
            }
            return serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| CorralError::InvalidResponse(format!("malformed registry response: {}", e)));
        }

        let error: V2Error = serde_json::from_str(&body).map_err(|_| {
            CorralError::TransientInfra(format!("registry returned {}: {}", status, body.trim()))
        })?;
        Err(match error.error_code {
            ERROR_KEY_NOT_FOUND => CorralError::NotFound(error.cause.unwrap_or_else(|| key.to_string())),
            ERROR_NODE_EXIST => CorralError::Conflict(key.to_string()),
            ERROR_EVENT_INDEX_CLEARED => CorralError::TransientInfra(error.message),
            code => CorralError::TransientInfra(format!("etcd error {}: {}", code, error.message)),
        })
    }

    async fn request(&self, build: impl Fn(&str) -> reqwest::RequestBuilder, key: &str) -> Result<V2Response> {
        let response = self.send(build, Some(self.config.request_timeout)).await?;
        Self::decode(response, key)
            .await?
            .ok_or_else(|| CorralError::InvalidResponse("empty registry response".into()))
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    /// A `Conflict` after an earlier endpoint failed mid-request may be our
    /// own write, committed before that endpoint errored. It counts as
    /// success when the stored value is the one we sent.
    async fn create(&self, key: &str, value: String) -> Result<()> {
        let sent = self
            .send_tracked(
                |endpoint| {
                    self.client
                        .put(Self::key_url(endpoint, key))
                        .query(&[("prevExist", "false")])
                        .form(&[("value", value.as_str())])
                },
                Some(self.config.request_timeout),
            )
            .await?;

        match Self::decode(sent.response, key).await {
            Ok(_) => Ok(()),
            Err(CorralError::Conflict(_)) if sent.maybe_applied => {
                let existing = self.get(key).await?;
                if existing.value == value {
                    tracing::debug!(key = %key, "create already applied by a failed endpoint");
                    Ok(())
                } else {
                    Err(CorralError::Conflict(key.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, key: &str) -> Result<KeyValue> {
        let response = self
            .request(|endpoint| self.client.get(Self::key_url(endpoint, key)), key)
            .await?;
        match response.node {
            Some(V2Node {
                key: Some(node_key),
                value: Some(value),
                modified_index,
                ..
            }) => Ok(KeyValue {
                key: node_key,
                value,
                modified_index,
            }),
            // A directory or a node without value is not a record.
            _ => Err(CorralError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.request(|endpoint| self.client.delete(Self::key_url(endpoint, key)), key)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let response = self
            .request(
                |endpoint| {
                    self.client
                        .get(Self::key_url(endpoint, prefix))
                        .query(&[("recursive", "true"), ("sorted", "true")])
                },
                prefix,
            )
            .await?;

        let mut leaves = Vec::new();
        if let Some(root) = response.node {
            if root.dir {
                for child in root.nodes {
                    collect_leaves(child, &mut leaves);
                }
            }
        }
        Ok(leaves)
    }

    async fn watch(&self, prefix: &str, wait_index: Option<u64>) -> Result<WatchEvent> {
        let wait_index = wait_index.map(|i| i.to_string());

        loop {
            let response = self
                .send(
                    |endpoint| {
                        let mut request = self
                            .client
                            .get(Self::key_url(endpoint, prefix))
                            .query(&[("wait", "true"), ("recursive", "true")]);
                        if let Some(index) = &wait_index {
                            request = request.query(&[("waitIndex", index.as_str())]);
                        }
                        request
                    },
                    None,
                )
                .await?;

            let Some(decoded) = Self::decode(response, prefix).await? else {
                continue;
            };
            let (key, index) = decoded
                .node
                .map(|node| (node.key.unwrap_or_default(), node.modified_index))
                .unwrap_or_default();

            return Ok(WatchEvent {
                action: WatchAction::parse(&decoded.action),
                key,
                index,
            });
        }
    }
}
