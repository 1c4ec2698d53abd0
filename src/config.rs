//! Server and client configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file (server
//! only), then environment variables (a `.env` file is honoured), and finally
//! whatever the binaries override from their command line flags.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Largest accepted request body (matches the 50mb JSON limit of the web front-end)
pub const DEFAULT_BODY_LIMIT: usize = 50 * 1024 * 1024;

/// Per-subscriber queue depth before a slow subscriber is dropped
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Fixed delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sync server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind: SocketAddr,

    /// Directory holding one record file per domain
    pub data_dir: PathBuf,

    /// Maximum request body size in bytes
    pub body_limit_bytes: usize,

    /// Bounded queue size per push subscriber
    pub subscriber_buffer: usize,

    /// Write a daily rolling log file here in addition to stderr
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            data_dir: PathBuf::from("data"),
            body_limit_bytes: DEFAULT_BODY_LIMIT,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Load defaults, then the optional TOML file, then the environment
    pub fn load(file: Option<&Path>) -> SyncResult<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Read a TOML config file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| SyncError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Override fields from `STATE_SYNC_*` environment variables
    pub fn apply_env(&mut self) -> SyncResult<()> {
        dotenvy::dotenv().ok();

        if let Ok(bind) = std::env::var("STATE_SYNC_BIND") {
            self.bind = bind
                .parse()
                .map_err(|e| SyncError::Config(format!("STATE_SYNC_BIND '{bind}': {e}")))?;
        }
        if let Ok(dir) = std::env::var("STATE_SYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("STATE_SYNC_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }

        Ok(())
    }
}

/// Sync client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the sync server, e.g. `http://localhost:3000`
    pub server_url: Url,

    /// Directory for the local fallback cache
    pub cache_dir: PathBuf,

    /// Domains fetched on every (re)connect
    pub domains: Vec<String>,

    /// Delay before each reconnect attempt
    pub reconnect_delay: Duration,

    /// Timeout for fetch/replace requests
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: &str, cache_dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let server_url = Url::parse(server_url)
            .map_err(|e| SyncError::Config(format!("invalid server url '{server_url}': {e}")))?;

        match server_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SyncError::Config(format!(
                    "server url must be http or https, got '{other}'"
                )))
            }
        }

        Ok(Self {
            server_url,
            cache_dir: cache_dir.into(),
            domains: Vec::new(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Load configuration from environment variables
    pub fn from_env() -> SyncResult<Self> {
        dotenvy::dotenv().ok();

        let url = std::env::var("STATE_SYNC_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());
        let cache_dir =
            std::env::var("STATE_SYNC_CACHE_DIR").unwrap_or_else(|_| ".state-cache".to_string());

        let mut config = Self::new(&url, cache_dir)?;

        if let Ok(ms) = std::env::var("STATE_SYNC_RECONNECT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|e| SyncError::Config(format!("STATE_SYNC_RECONNECT_MS '{ms}': {e}")))?;
            config.reconnect_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// `GET`/`POST` endpoint for one domain, with the domain percent-encoded
    pub fn state_url(&self, domain: &str) -> SyncResult<Url> {
        self.endpoint(&["api", domain, "state"])
    }

    pub fn health_url(&self) -> SyncResult<Url> {
        self.endpoint(&["api", "health"])
    }

    /// Push channel endpoint (`ws://` or `wss://`)
    pub fn ws_url(&self) -> SyncResult<Url> {
        let mut url = self.endpoint(&["ws"])?;
        let scheme = if self.server_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Config(format!("cannot use {scheme} with {url}")))?;
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.server_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("{} cannot be a base url", self.server_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.body_limit_bytes, 50 * 1024 * 1024);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_server_config_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state-sync.toml");
        std::fs::write(
            &path,
            "bind = \"127.0.0.1:4100\"\ndata_dir = \"/var/lib/state\"\n",
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.bind.port(), 4100);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/state"));
        assert_eq!(config.subscriber_buffer, DEFAULT_SUBSCRIBER_BUFFER);
    }

    #[test]
    fn test_client_urls() {
        let config = ClientConfig::new("http://localhost:3000/", "cache").unwrap();
        assert_eq!(
            config.state_url("quantum").unwrap().as_str(),
            "http://localhost:3000/api/quantum/state"
        );
        assert_eq!(config.ws_url().unwrap().as_str(), "ws://localhost:3000/ws");

        let secure = ClientConfig::new("https://sync.example.com/base", "cache").unwrap();
        assert_eq!(
            secure.ws_url().unwrap().as_str(),
            "wss://sync.example.com/base/ws"
        );
    }

    #[test]
    fn test_client_domain_is_encoded() {
        let config = ClientConfig::new("http://localhost:3000", "cache").unwrap();
        let url = config.state_url("a/b c").unwrap();
        assert_eq!(url.path(), "/api/a%2Fb%20c/state");
    }

    #[test]
    fn test_client_rejects_ws_scheme() {
        assert!(ClientConfig::new("ws://localhost:3000", "cache").is_err());
    }
}
