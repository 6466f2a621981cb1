//! Configuration validation.

use crate::config::{Config, Protocol};
use std::collections::HashSet;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - At least one listener
/// - Unique listener names and addresses
/// - Parseable socket addresses for tcp and http listeners
/// - Non-empty paths for unix listeners
/// - A non-zero grace period and job interval when set
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.listeners.is_empty() {
        errors.push("at least one listener must be defined".to_string());
    }

    let mut names = HashSet::new();
    let mut addresses = HashSet::new();

    for listener in &config.listeners {
        if listener.name.is_empty() {
            errors.push("listener name cannot be empty".to_string());
        }

        if !names.insert(&listener.name) {
            errors.push(format!("duplicate listener name: {}", listener.name));
        }

        if !addresses.insert(&listener.address) {
            errors.push(format!(
                "duplicate listen address: {} (listener: {})",
                listener.address, listener.name
            ));
        }

        match listener.protocol {
            Protocol::Tcp | Protocol::Http => {
                if let Err(e) = listener.socket_addr() {
                    errors.push(format!(
                        "listener '{}' has invalid address '{}': {}",
                        listener.name, listener.address, e
                    ));
                }
            }
            Protocol::Unix => {
                if listener.address.is_empty() {
                    errors.push(format!(
                        "unix listener '{}' must have a socket path",
                        listener.name
                    ));
                }
            }
        }
    }

    if config.shutdown.grace_period == Some(Duration::ZERO) {
        errors.push("grace_period must be greater than zero (omit it to wait indefinitely)".to_string());
    }

    if let Some(ref job) = config.job {
        if job.interval.is_zero() {
            errors.push("job interval must be greater than zero".to_string());
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn listener(name: &str, address: &str, protocol: Protocol) -> ListenerConfig {
        ListenerConfig {
            name: name.to_string(),
            address: address.to_string(),
            protocol,
            keepalive: None,
        }
    }

    fn minimal_config() -> Config {
        Config {
            global: GlobalConfig::default(),
            shutdown: ShutdownConfig::default(),
            metrics: MetricsConfig::default(),
            job: None,
            listeners: vec![listener("web", "127.0.0.1:3007", Protocol::Http)],
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&minimal_config()).is_ok());
    }

    #[test]
    fn test_no_listeners() {
        let mut config = minimal_config();
        config.listeners.clear();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("at least one listener"));
    }

    #[test]
    fn test_duplicate_listener_names() {
        let mut config = minimal_config();
        config
            .listeners
            .push(listener("web", "127.0.0.1:3008", Protocol::Tcp));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("duplicate listener name"));
    }

    #[test]
    fn test_duplicate_listen_address() {
        let mut config = minimal_config();
        config
            .listeners
            .push(listener("echo", "127.0.0.1:3007", Protocol::Tcp));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("duplicate listen address"));
    }

    #[test]
    fn test_invalid_tcp_address() {
        let mut config = minimal_config();
        config.listeners[0].address = "not-an-address".to_string();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("invalid address"));
    }

    #[test]
    fn test_unix_listener_needs_path() {
        let mut config = minimal_config();
        config.listeners.push(listener("local", "", Protocol::Unix));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("socket path"));
    }

    #[test]
    fn test_zero_grace_period() {
        let mut config = minimal_config();
        config.shutdown.grace_period = Some(Duration::ZERO);
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("grace_period"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal_config();
        config.global.log_level = "loud".to_string();
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("invalid log level"));
    }

    #[test]
    fn test_collects_every_problem() {
        let mut config = minimal_config();
        config.listeners[0].address = "bogus".to_string();
        config.global.log_level = "loud".to_string();
        let message = validate_config(&config).unwrap_err();
        assert!(message.contains("invalid address"));
        assert!(message.contains("invalid log level"));
    }
}
