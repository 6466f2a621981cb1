//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Shutdown escalation policy
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Metrics endpoint
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Optional periodic background job registered as in-flight work
    #[serde(default)]
    pub job: Option<JobConfig>,

    /// Listeners to serve
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Shutdown escalation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// Whether a second termination signal forces an immediate exit
    #[serde(default = "default_true")]
    pub hard_shutdown: bool,

    /// How long to wait for in-flight work before forcing an exit.
    /// Absent means wait indefinitely.
    #[serde(default, with = "option_humantime_serde")]
    pub grace_period: Option<Duration>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            hard_shutdown: true,
            grace_period: None,
        }
    }
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Periodic background job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Pause between runs
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// How long each run takes
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

/// A listener to serve.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Unique name for this listener
    pub name: String,

    /// `host:port` for tcp and http, a filesystem path for unix
    pub address: String,

    /// Protocol: tcp, http or unix
    #[serde(default)]
    pub protocol: Protocol,

    /// TCP keep-alive period for accepted connections; null disables
    #[serde(default = "default_keepalive", with = "option_humantime_serde")]
    pub keepalive: Option<Duration>,
}

impl ListenerConfig {
    /// Parse the address as a socket address (tcp and http listeners).
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.address.parse()
    }
}

/// Protocol type.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP echo
    #[default]
    Tcp,
    /// HTTP/1.1 with connection draining
    Http,
    /// Unix-domain socket echo
    Unix,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_keepalive() -> Option<Duration> {
    Some(crate::net::DEFAULT_KEEPALIVE)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom serde module for optional humantime durations.
mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_defaults() {
        let shutdown = ShutdownConfig::default();
        assert!(shutdown.hard_shutdown);
        assert!(shutdown.grace_period.is_none());
    }

    #[test]
    fn test_grace_period_parsing() {
        let shutdown: ShutdownConfig =
            serde_yaml::from_str("hard_shutdown: false\ngrace_period: 3m").unwrap();
        assert!(!shutdown.hard_shutdown);
        assert_eq!(shutdown.grace_period, Some(Duration::from_secs(180)));
    }

    #[test]
    fn test_listener_keepalive() {
        let listener: ListenerConfig =
            serde_yaml::from_str("name: web\naddress: \"127.0.0.1:3007\"\nprotocol: http").unwrap();
        assert_eq!(listener.protocol, Protocol::Http);
        assert_eq!(listener.keepalive, Some(Duration::from_secs(180)));

        let listener: ListenerConfig =
            serde_yaml::from_str("name: web\naddress: \"127.0.0.1:3007\"\nkeepalive: ~").unwrap();
        assert_eq!(listener.protocol, Protocol::Tcp);
        assert_eq!(listener.keepalive, None);
    }

    #[test]
    fn test_protocol_serde() {
        let protocol: Protocol = serde_yaml::from_str("unix").unwrap();
        assert_eq!(protocol, Protocol::Unix);
    }
}
