//! Configuration for the profile downloader.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use podprof_tunnel::{DEFAULT_REMOTE_PORT, TunnelConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Address of a local `kubectl proxy`.
pub const DEFAULT_API_SERVER: &str = "http://127.0.0.1:8001";

/// Namespace searched when the caller does not name one.
pub const DEFAULT_NAMESPACE: &str = "knative-serving";

/// Configuration for a [`Downloader`](crate::Downloader).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Base URL of the cluster API server (`kubectl proxy` by default).
    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// Namespace of the target pod.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Local port to listen on; 0 picks an ephemeral port.
    #[serde(default)]
    pub local_port: u16,

    /// Port of the pprof server inside the pod.
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Deadline for one profile request. None leaves long sampling windows unbounded.
    #[serde(with = "optional_duration_secs", default)]
    pub request_timeout: Option<Duration>,

    /// Extra headers sent verbatim on the port-forward upgrade.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            namespace: default_namespace(),
            local_port: 0,
            remote_port: default_remote_port(),
            request_timeout: None,
            headers: BTreeMap::new(),
        }
    }
}

impl DownloaderConfig {
    /// Create a config pointed at the given API server.
    pub fn with_api_server(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            ..Default::default()
        }
    }

    /// Parsed API server URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when `api_server` is not an absolute URL.
    pub fn api_server_url(&self) -> Result<Url> {
        Url::parse(&self.api_server).map_err(|e| {
            Error::config_error(format!("invalid API server '{}': {e}", self.api_server))
        })
    }

    /// Set the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the local listening port.
    #[must_use]
    pub const fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Set the remote pprof port.
    #[must_use]
    pub const fn remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Add a header for the port-forward upgrade.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Port settings for the tunnel.
    pub const fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            local_port: self.local_port,
            remote_port: self.remote_port,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Unparseable ports and timeouts are ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PODPROF_API_SERVER") {
            config.api_server = url;
        }

        if let Ok(namespace) = std::env::var("PODPROF_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Some(port) = env_parse("PODPROF_LOCAL_PORT") {
            config.local_port = port;
        }

        if let Some(port) = env_parse("PODPROF_REMOTE_PORT") {
            config.remote_port = port;
        }

        if let Some(secs) = env_parse("PODPROF_REQUEST_TIMEOUT") {
            config.request_timeout = Some(Duration::from_secs(secs));
        }

        if let Ok(token) = std::env::var("PODPROF_AUTHORIZATION") {
            config.headers.insert("Authorization".to_string(), token);
        }

        config
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the file cannot be read and `Error::Config`
    /// when it does not parse.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::config_error(format!("Failed to parse config: {e}")))
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::config_error(format!("Failed to parse config: {e}")))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn default_api_server() -> String {
    DEFAULT_API_SERVER.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

const fn default_remote_port() -> u16 {
    DEFAULT_REMOTE_PORT
}

/// Serialization helper for an optional Duration as seconds.
mod optional_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
