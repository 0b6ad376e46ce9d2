//! Configuration loading: `config.toml` plus environment overrides.

use lanlink_types::config::lanlink_home;
use lanlink_types::LanlinkConfig;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `~/.lanlink/config.toml`.
pub fn default_config_path() -> PathBuf {
    lanlink_home().join("config.toml")
}

/// Load configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file is logged and replaced by the
/// defaults; startup never fails on config.
pub fn load_config(path: Option<&Path>) -> LanlinkConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<LanlinkConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    LanlinkConfig::default()
}

/// Apply `ANNOUNCE_ADDR`, `SERVICE_PORT` and `ANNOUNCE_INTERVAL` from the
/// process environment.
pub fn apply_env_overrides(config: &mut LanlinkConfig) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut LanlinkConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(value) = non_empty(lookup("ANNOUNCE_ADDR")) {
        match value.parse::<SocketAddrV4>() {
            Ok(addr) => config.discovery.multicast_addr = addr,
            Err(e) => warn!(var = "ANNOUNCE_ADDR", value = %value, error = %e, "Ignoring invalid override"),
        }
    }
    if let Some(value) = non_empty(lookup("SERVICE_PORT")) {
        match value.parse::<u16>() {
            Ok(port) => config.network.service_port = port,
            Err(e) => warn!(var = "SERVICE_PORT", value = %value, error = %e, "Ignoring invalid override"),
        }
    }
    if let Some(value) = non_empty(lookup("ANNOUNCE_INTERVAL")) {
        match value.parse::<u64>() {
            Ok(secs) => config.discovery.announce_interval_secs = secs,
            Err(e) => warn!(var = "ANNOUNCE_INTERVAL", value = %value, error = %e, "Ignoring invalid override"),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn with_env(vars: &[(&str, &str)]) -> LanlinkConfig {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = LanlinkConfig::default();
        apply_overrides(&mut config, |key| env.get(key).cloned());
        config
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config.network.service_port, 40480);
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[network]\nservice_port = 5555\n\n[discovery]\nenabled = false\n",
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.network.service_port, 5555);
        assert!(!config.discovery.enabled);
    }

    #[test]
    fn test_load_config_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network\nservice_port = ").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.network.service_port, 40480);
    }

    #[test]
    fn test_env_overrides() {
        let config = with_env(&[
            ("ANNOUNCE_ADDR", "239.1.2.3:5000"),
            ("SERVICE_PORT", "6000"),
            ("ANNOUNCE_INTERVAL", "10"),
        ]);
        assert_eq!(config.discovery.multicast_addr.to_string(), "239.1.2.3:5000");
        assert_eq!(config.network.service_port, 6000);
        assert_eq!(config.discovery.announce_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_or_empty_overrides_are_ignored() {
        let config = with_env(&[
            ("ANNOUNCE_ADDR", ""),
            ("SERVICE_PORT", "not-a-port"),
            ("ANNOUNCE_INTERVAL", "-3"),
        ]);
        let defaults = LanlinkConfig::default();
        assert_eq!(config.discovery.multicast_addr, defaults.discovery.multicast_addr);
        assert_eq!(config.network.service_port, defaults.network.service_port);
        assert_eq!(
            config.discovery.announce_interval_secs,
            defaults.discovery.announce_interval_secs
        );
    }
}
