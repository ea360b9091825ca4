//! Transport configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RNTBD_CONFIG)
//! 3. Environment variables

use rntbd_protocol::CallerId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bounds for the keep-alive environment overrides, in seconds.
pub const KEEPALIVE_RANGE: std::ops::RangeInclusive<u64> = 1..=100;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled web roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI and certificate checks (defaults to the target host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("RNTBD_TLS_ENABLED") {
            self.enabled = parse_bool(&enabled).unwrap_or(self.enabled);
        }
        if let Some(path) = var("RNTBD_TLS_CA_CERT") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(insecure) = var("RNTBD_TLS_INSECURE") {
            self.insecure = parse_bool(&insecure).unwrap_or(self.insecure);
        }
        if let Some(name) = var("RNTBD_TLS_SERVER_NAME") {
            self.server_name = Some(name);
        }
    }
}

/// TCP keep-alive probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub time: Duration,
    /// Interval between probes.
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(30),
            interval: Duration::from_secs(1),
        }
    }
}

/// Thresholds for transit-timeout based health detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitTimeoutConfig {
    pub enabled: bool,
    /// Any timeout plus this much silence marks the connection unhealthy.
    pub silence: Duration,
    /// Timeouts needed before `frequent_silence` applies.
    pub frequent_count: u32,
    pub frequent_silence: Duration,
    /// Silence after a write timeout that marks the connection unhealthy.
    pub write_silence: Duration,
}

impl Default for TransitTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            silence: Duration::from_secs(60),
            frequent_count: 3,
            frequent_silence: Duration::from_secs(10),
            write_silence: Duration::from_secs(6),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for DNS, connect, TLS and negotiation together.
    pub open_timeout: Duration,
    /// Deadline for one request on an open channel.
    pub request_timeout: Duration,
    /// Replies missing for this long after a send mark the connection hung.
    pub receive_hang_detection: Duration,
    /// A send stuck for this long marks the connection hung.
    pub send_hang_detection: Duration,
    /// Idle timeout. `None` disables idle monitoring.
    pub idle_timeout: Option<Duration>,
    pub keepalive: KeepaliveConfig,
    pub transit_timeouts: TransitTimeoutConfig,
    /// User agent sent during negotiation.
    pub user_agent: String,
    pub caller_id: CallerId,
    pub enable_channel_multiplexing: bool,
    /// TLS configuration. `None` or disabled means plain TCP.
    pub tls: Option<TlsClientConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            receive_hang_detection: Duration::from_secs(65),
            send_hang_detection: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(1800)),
            keepalive: KeepaliveConfig::default(),
            transit_timeouts: TransitTimeoutConfig::default(),
            user_agent: format!("rntbd-client/{}", env!("CARGO_PKG_VERSION")),
            caller_id: CallerId::Anonymous,
            enable_channel_multiplexing: false,
            tls: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_caller_id(mut self, caller_id: CallerId) -> Self {
        self.caller_id = caller_id;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_hang_detection(mut self, receive: Duration, send: Duration) -> Self {
        self.receive_hang_detection = receive;
        self.send_hang_detection = send;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_transit_timeouts(mut self, transit_timeouts: TransitTimeoutConfig) -> Self {
        self.transit_timeouts = transit_timeouts;
        self
    }

    pub fn with_channel_multiplexing(mut self, enabled: bool) -> Self {
        self.enable_channel_multiplexing = enabled;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.enabled)
    }
}

/// File- and environment-backed transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub open_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub receive_hang_detection_secs: u64,
    pub send_hang_detection_secs: u64,
    /// Idle timeout in seconds; 0 disables idle monitoring.
    pub idle_timeout_secs: u64,
    pub keepalive_time_secs: u64,
    pub keepalive_interval_secs: u64,
    pub transit_timeout_detection: bool,
    pub user_agent: Option<String>,
    pub enable_channel_multiplexing: bool,
    pub tls: TlsClientConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            open_timeout_secs: defaults.open_timeout.as_secs(),
            request_timeout_secs: defaults.request_timeout.as_secs(),
            receive_hang_detection_secs: defaults.receive_hang_detection.as_secs(),
            send_hang_detection_secs: defaults.send_hang_detection.as_secs(),
            idle_timeout_secs: defaults.idle_timeout.map_or(0, |t| t.as_secs()),
            keepalive_time_secs: defaults.keepalive.time.as_secs(),
            keepalive_interval_secs: defaults.keepalive.interval.as_secs(),
            transit_timeout_detection: defaults.transit_timeouts.enabled,
            user_agent: None,
            enable_channel_multiplexing: false,
            tls: TlsClientConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("RNTBD_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        let secs = |name: &str| var(name).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = secs("RNTBD_OPEN_TIMEOUT") {
            self.open_timeout_secs = v;
        }
        if let Some(v) = secs("RNTBD_REQUEST_TIMEOUT") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = secs("RNTBD_RECEIVE_HANG_DETECTION") {
            self.receive_hang_detection_secs = v;
        }
        if let Some(v) = secs("RNTBD_SEND_HANG_DETECTION") {
            self.send_hang_detection_secs = v;
        }
        if let Some(v) = secs("RNTBD_IDLE_TIMEOUT") {
            self.idle_timeout_secs = v;
        }
        if let Some(v) = secs("RNTBD_KEEPALIVE_TIME") {
            self.keepalive_time_secs = v.clamp(*KEEPALIVE_RANGE.start(), *KEEPALIVE_RANGE.end());
        }
        if let Some(v) = secs("RNTBD_KEEPALIVE_INTERVAL") {
            self.keepalive_interval_secs =
                v.clamp(*KEEPALIVE_RANGE.start(), *KEEPALIVE_RANGE.end());
        }
        if let Some(v) = var("RNTBD_TRANSIT_TIMEOUT_DETECTION").and_then(|v| parse_bool(&v)) {
            self.transit_timeout_detection = v;
        }
        if let Some(v) = var("RNTBD_USER_AGENT") {
            self.user_agent = Some(v);
        }
        self.tls.apply_overrides(var);
    }

    /// Rejects settings the health checker cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receive_hang_detection_secs <= 10 {
            return Err(ConfigError::ValidationError(format!(
                "receive_hang_detection_secs must exceed 10, got {}",
                self.receive_hang_detection_secs
            )));
        }
        if self.send_hang_detection_secs <= 2 {
            return Err(ConfigError::ValidationError(format!(
                "send_hang_detection_secs must exceed 2, got {}",
                self.send_hang_detection_secs
            )));
        }
        if self.tls.insecure && self.tls.ca_cert_path.is_some() {
            return Err(ConfigError::ValidationError(
                "tls.insecure and tls.ca_cert_path are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the connection configuration these settings describe.
    pub fn connection_config(&self) -> ConnectionConfig {
        let defaults = ConnectionConfig::default();
        ConnectionConfig {
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            receive_hang_detection: Duration::from_secs(self.receive_hang_detection_secs),
            send_hang_detection: Duration::from_secs(self.send_hang_detection_secs),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            keepalive: KeepaliveConfig {
                time: Duration::from_secs(self.keepalive_time_secs),
                interval: Duration::from_secs(self.keepalive_interval_secs),
            },
            transit_timeouts: TransitTimeoutConfig {
                enabled: self.transit_timeout_detection,
                ..TransitTimeoutConfig::default()
            },
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
            enable_channel_multiplexing: self.enable_channel_multiplexing,
            tls: self.tls.enabled.then(|| self.tls.clone()),
            ..defaults
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
