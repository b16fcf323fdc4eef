/// Config schema types: endpoints, transports, scripting, proxy mode, ACME.
use std::path::{Path, PathBuf};

use {
    ipnet::IpNet,
    serde::{Deserialize, Serialize},
};

/// Let's Encrypt production directory, used when `[acme] directory` is unset.
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Minimum level of log lines that reach the log sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// File this config was loaded from. Relative paths resolve against its directory.
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    pub log_level: LogLevel,

    /// Start the identd responder alongside the listeners.
    pub identd: bool,

    /// Directory of static files served on `/`.
    pub webroot: Option<String>,

    /// Transport adapters to enable, by name (e.g. "websocket", "sockjs", "kiwiirc").
    pub transports: Vec<String>,

    /// Peers in these ranges may set the client address via `X-Forwarded-For`.
    pub reverse_proxies: Vec<IpNet>,

    /// One listener is started per entry.
    pub servers: Vec<ServerConfig>,

    pub scripting: ScriptingConfig,
    pub proxy: ProxyConfig,
    pub acme: AcmeConfig,
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            log_level: LogLevel::default(),
            identd: false,
            webroot: None,
            transports: vec!["websocket".into(), "sockjs".into(), "kiwiirc".into()],
            reverse_proxies: Vec::new(),
            servers: vec![ServerConfig::default()],
            scripting: ScriptingConfig::default(),
            proxy: ProxyConfig::default(),
            acme: AcmeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Resolve `path` against the directory of the loaded config file.
    ///
    /// Absolute paths are returned unchanged, as are all paths when the
    /// config was not loaded from a file.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.config_file.as_deref().and_then(Path::parent) {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }
}

/// A single listening endpoint.
///
/// `bind` accepts a `tcp:` prefix for raw IRC connections and a `unix:` prefix
/// for a Unix domain socket path; anything else is an HTTP listener address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub tls: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
    /// Certificates are obtained automatically and cached here when set.
    pub letsencrypt_cache: Option<String>,
    /// Permission bits applied to a Unix socket after binding.
    pub bind_mode: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 80,
            tls: false,
            cert: None,
            key: None,
            letsencrypt_cache: None,
            bind_mode: 0o755,
        }
    }
}

impl ServerConfig {
    /// Human-readable label used in logs.
    pub fn label(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Embedded scripting engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    pub path: Option<String>,
    pub workers: usize,
}

/// Forward proxy mode listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7999,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// ACME directory URL.
    pub directory: String,
    /// Account contact URIs, e.g. `mailto:ops@example.org`.
    pub contact: Vec<String>,
    /// Only these host names get certificates. Empty allows any SNI name.
    pub domains: Vec<String>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory: LETSENCRYPT_PRODUCTION.into(),
            contact: Vec::new(),
            domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Lines buffered between log producers and the sink before producers block.
    pub channel_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_relative_to_config_file() {
        let config = GatewayConfig {
            config_file: Some(PathBuf::from("/etc/webirc/webircgateway.toml")),
            ..GatewayConfig::default()
        };
        assert_eq!(
            config.resolve_path("certs/gw.pem"),
            PathBuf::from("/etc/webirc/certs/gw.pem")
        );
        assert_eq!(config.resolve_path("/srv/www"), PathBuf::from("/srv/www"));
    }

    #[test]
    fn resolve_path_without_config_file() {
        let config = GatewayConfig::default();
        assert_eq!(config.resolve_path("www"), PathBuf::from("www"));
    }

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.label(), "0.0.0.0:80");
        assert_eq!(server.bind_mode, 0o755);
        assert!(!server.tls);
    }
}
