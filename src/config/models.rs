//! Configuration data structures for kingress.
//!
//! Every field has a default, so an empty configuration is a working one.
//! Durations are written in humantime notation (`1s`, `250ms`, `1h`).
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::session::DEFAULT_COOKIE_NAME;

/// Root controller configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Plaintext listener address
    pub http_addr: String,
    /// TLS listener address
    pub https_addr: String,
    pub reconcile: ReconcileConfig,
    pub cluster: ClusterConfig,
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
    /// Hostnames served by the dummy backend (plugin-only hosts)
    pub dummy_hosts: Vec<String>,
    pub plugins: PluginsConfig,
    pub logging: LoggingConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:80".to_string(),
            https_addr: "0.0.0.0:443".to_string(),
            reconcile: ReconcileConfig::default(),
            cluster: ClusterConfig::default(),
            proxy: ProxyConfig::default(),
            session: SessionConfig::default(),
            dummy_hosts: Vec::new(),
            plugins: PluginsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Time between reconciliation cycles
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    /// Upper bound on every individual cluster call
    #[serde(with = "humantime_duration")]
    pub call_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Ingress class this controller serves
    pub ingress_class: String,
    /// Namespace the controller's own Service lives in
    pub namespace: String,
    /// The controller's own Service; its load-balancer address is published
    /// into the status of every served Ingress
    pub service_name: Option<String>,
    /// Field manager used for status writes
    pub field_manager: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ingress_class: "kingress".to_string(),
            namespace: "default".to_string(),
            service_name: None,
            field_manager: "kingress".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bound on a forwarded exchange and on a spliced WebSocket connection
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Base cookie name; secure responses use the `__Host-` prefixed variant
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PluginsConfig {
    pub basic_auth: bool,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self { basic_auth: true }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `kingress=debug,kube=warn`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Serde adapter for durations written as humantime strings.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }
}
