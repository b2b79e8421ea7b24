use crate::reconcile::{ReconcileOptions, SECURE_GROUP_NAME};
use crate::transport::DEFAULT_ADMIN_URL;
use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// App registry storage
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Proxy admin endpoint and reconciliation policy
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the API server (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the API server (default: 8081)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token for the API.
    /// If not set, a random token is generated at startup and logged
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite file (default: ./data.sqlite3)
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Base URL of the proxy admin API (default: http://localhost:2019)
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Timeout for each admin API request in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Host the proxy dials for every app (default: 127.0.0.1)
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Remove static catch-all routes from plaintext listeners (default: true)
    #[serde(default = "default_true")]
    pub strip_plaintext_catch_all: bool,

    /// Reconcile every registered app once at startup (default: false)
    #[serde(default)]
    pub sync_on_startup: bool,

    /// Listener port that marks a plaintext group (default: 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Listener port that marks a secure group (default: 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8081
}

fn default_database_path() -> String {
    "./data.sqlite3".to_string()
}

fn default_admin_url() -> String {
    DEFAULT_ADMIN_URL.to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            auth_token: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            request_timeout_secs: default_request_timeout(),
            upstream_host: default_upstream_host(),
            strip_plaintext_catch_all: true,
            sync_on_startup: false,
            http_port: default_http_port(),
            https_port: default_https_port(),
        }
    }
}

impl ServerConfig {
    /// Parsed bind address of the API server
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("Invalid API bind address '{}:{}'", self.bind, self.port))
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reconciliation policy derived from this section
    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            http_port: self.http_port,
            https_port: self.https_port,
            upstream_host: self.upstream_host.clone(),
            strip_plaintext_catch_all: self.strip_plaintext_catch_all,
            secure_group_name: SECURE_GROUP_NAME.to_string(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = Self::read(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Read the file (or take the defaults when it is missing), apply the
    /// admin URL override, then validate the result once
    pub fn load_or_default<P: AsRef<Path>>(
        path: P,
        admin_url_override: Option<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            Self::read(path)?
        } else {
            Config::default()
        };

        let config = config.with_admin_url_override(admin_url_override);
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply the admin URL from the environment, when set and non-empty
    pub fn with_admin_url_override(mut self, admin_url: Option<String>) -> Self {
        if let Some(url) = admin_url.filter(|url| !url.trim().is_empty()) {
            self.proxy.admin_url = url.trim().to_string();
        }
        self
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let admin_url = self.proxy.admin_url.trim();
        if admin_url.is_empty() {
            errors.push("proxy.admin_url must not be empty".to_string());
        } else if !admin_url.starts_with("http://") && !admin_url.starts_with("https://") {
            errors.push(format!(
                "proxy.admin_url '{}' must start with http:// or https://",
                admin_url
            ));
        }

        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than 0".to_string());
        }

        if self.proxy.upstream_host.trim().is_empty() {
            errors.push("proxy.upstream_host must not be empty".to_string());
        }

        if self.proxy.http_port == 0 || self.proxy.https_port == 0 {
            errors.push("proxy.http_port and proxy.https_port must be greater than 0".to_string());
        } else if self.proxy.http_port == self.proxy.https_port {
            errors.push("proxy.http_port and proxy.https_port must differ".to_string());
        }

        if self.database.path.trim().is_empty() {
            errors.push("database.path must not be empty".to_string());
        }

        if let Some(token) = &self.server.auth_token {
            if token.trim().is_empty() {
                errors.push("server.auth_token must not be empty when set".to_string());
            }
        }

        if let Err(e) = self.server.socket_addr() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
