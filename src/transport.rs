//! Client for the proxy's admin API
//!
//! The reconciler only needs two calls, fetch and replace of the
//! `apps/http/servers` subtree. The whole-config calls back the raw editor
//! endpoints of the API server. No call is retried; every failure comes back
//! to the caller as a [`TransportError`].

use crate::error::TransportError;
use crate::tree::{listener_groups_to_json, parse_listener_groups, ListenerGroupMap};
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default admin endpoint of a local Caddy
pub const DEFAULT_ADMIN_URL: &str = "http://localhost:2019";

/// Environment variable that overrides the admin endpoint
pub const ADMIN_URL_ENV: &str = "CADDY_URL";

const SERVERS_PATH: &str = "/config/apps/http/servers";
const CONFIG_PATH: &str = "/config/";
const LOAD_PATH: &str = "/load";

/// Operations against the proxy's admin endpoint
pub trait AdminTransport: Send + Sync {
    /// Fetch the current listener-group map
    fn fetch_listener_groups(
        &self,
    ) -> impl Future<Output = Result<ListenerGroupMap, TransportError>> + Send;

    /// Replace the listener-group map in one call
    fn replace_listener_groups(
        &self,
        groups: &ListenerGroupMap,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Fetch the whole proxy configuration
    fn fetch_full_config(&self) -> impl Future<Output = Result<FullConfig, TransportError>> + Send;

    /// Load a whole configuration, replacing the running one
    fn replace_full_config(
        &self,
        config: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Admin endpoint settings of the proxy itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enforce_origin: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The whole proxy configuration, as shown in the raw editor.
///
/// Apps are kept as raw JSON; unknown top-level keys (`logging`, `storage`, ...)
/// survive in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub apps: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FullConfig {
    /// Parse a `/config/` response; `null` means no configuration is loaded
    pub fn parse(body: &[u8]) -> serde_json::Result<Self> {
        let config: Option<FullConfig> = serde_json::from_slice(body)?;
        Ok(config.unwrap_or_default())
    }
}

/// Admin API client backed by reqwest
#[derive(Debug, Clone)]
pub struct CaddyClient {
    base_url: String,
    http: reqwest::Client,
}

impl CaddyClient {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<Bytes, TransportError> {
        let url = self.url(path);
        debug!(%url, "Fetching from proxy admin");
        let response = self.http.get(&url).send().await?;
        read_success(response).await
    }

    async fn post(&self, path: &str, body: impl Into<reqwest::Body>) -> Result<(), TransportError> {
        let url = self.url(path);
        debug!(%url, "Posting to proxy admin");
        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await?;
        read_success(response).await.map(|_| ())
    }
}

impl AdminTransport for CaddyClient {
    async fn fetch_listener_groups(&self) -> Result<ListenerGroupMap, TransportError> {
        let body = self.get(SERVERS_PATH).await?;
        parse_listener_groups(&body).map_err(TransportError::Decode)
    }

    async fn replace_listener_groups(
        &self,
        groups: &ListenerGroupMap,
    ) -> Result<(), TransportError> {
        let body = listener_groups_to_json(groups).map_err(TransportError::Encode)?;
        self.post(SERVERS_PATH, body).await
    }

    async fn fetch_full_config(&self) -> Result<FullConfig, TransportError> {
        let body = self.get(CONFIG_PATH).await?;
        FullConfig::parse(&body).map_err(TransportError::Decode)
    }

    async fn replace_full_config(&self, config: Bytes) -> Result<(), TransportError> {
        self.post(LOAD_PATH, config.to_vec()).await
    }
}

async fn read_success(response: reqwest::Response) -> Result<Bytes, TransportError> {
    let status = response.status();
    let body = response.bytes().await?;
    if status.is_success() {
        return Ok(body);
    }
    Err(TransportError::Status {
        status: status.as_u16(),
        message: remote_error_message(&body),
    })
}

/// Extract the `{"error": "..."}` message from an admin error body,
/// falling back to the raw body text.
pub fn remote_error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct RemoteError {
        error: String,
    }

    match serde_json::from_slice::<RemoteError>(body) {
        Ok(remote) if !remote.error.is_empty() => remote.error,
        _ => String::from_utf8_lossy(body).trim().to_string(),
    }
}
