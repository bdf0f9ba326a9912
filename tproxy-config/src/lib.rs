use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Proxy configuration loaded from YAML.
///
/// Every field is optional in the file; missing sections take the defaults
/// below so an empty file (or no file at all) yields a working proxy that
/// listens on loopback and forwards everything directly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listener addresses and the connection timeout
    #[serde(default)]
    pub listen: ListenConfig,
    /// Ordered routing rules; first match wins
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Prometheus metrics server configuration
    #[serde(default)]
    pub metrics: Metrics,
}

/// Listener settings (two TCP sockets: one TLS-class, one HTTP-class).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Address both listeners bind to (default: "127.0.0.1")
    #[serde(default = "default_host")]
    pub host: String,
    /// Port receiving redirected TLS flows (default: 3130)
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Port receiving redirected plain-HTTP flows (default: 3131)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Per-connection I/O timeout in seconds (default: 900)
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// A single routing rule: a regex matched against the extracted host name
/// and the raw action string ("DIRECT", "DROP", or "host[:port]").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Regular expression tested against the host name
    pub pattern: String,
    /// What to do with a matching flow
    pub proxy: String,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection (default: false)
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_https_port() -> u16 {
    3130
}

fn default_http_port() -> u16 {
    3131
}

fn default_timeout() -> u64 {
    900
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            https_port: default_https_port(),
            http_port: default_http_port(),
            timeout: default_timeout(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tproxy_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("proxy_config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let contents = fs::read_to_string(path)?;
        let config = Self::from_str(&contents)?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use tproxy_config::Config;
    ///
    /// let yaml = r#"
    /// listen:
    ///   https_port: 8443
    /// rules:
    ///   - pattern: ".*"
    ///     proxy: "DIRECT"
    /// "#;
    ///
    /// let config = Config::from_str(yaml).unwrap();
    /// assert_eq!(config.listen.https_port, 8443);
    /// assert_eq!(config.listen.host, "127.0.0.1");
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the type system cannot express.
    ///
    /// Ports must be non-zero and distinct; the serde layer already bounds
    /// them to u16.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.listen.https_port == 0 || self.listen.http_port == 0 {
            return Err("listen ports must be in 1..=65535".into());
        }
        if self.listen.https_port == self.listen.http_port {
            return Err("https_port and http_port must differ".into());
        }
        if self.listen.timeout == 0 {
            return Err("timeout must be at least 1 second".into());
        }
        Ok(())
    }
}
