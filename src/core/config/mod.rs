use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::sessions::LifecycleConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: Option<String>,
    pub sessions: SessionConfig,
    pub side_effect_timeout: Duration,
    pub notifications: NotificationConfig,
    pub file_storage_root: String,
    /// JSON roster seeding the directory when no database is configured.
    pub roster_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub max_batch_size: usize,
    pub store_timeout: Duration,
    pub package_interval_days: u32,
}

#[derive(Clone, Debug)]
pub struct NotificationConfig {
    pub live_channel_capacity: usize,
    pub push_endpoint: Option<String>,
    pub push_server_key: Option<String>,
}

impl NotificationConfig {
    /// Push is enabled only when both the endpoint and the key are set.
    pub fn push_credentials(&self) -> Option<(&str, &str)> {
        match (self.push_endpoint.as_deref(), self.push_server_key.as_deref()) {
            (Some(endpoint), Some(key)) => Some((endpoint, key)),
            _ => None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        let config_map: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&config_map)
    }

    /// Builds the configuration from key/value pairs. Malformed numbers fall
    /// back to their defaults with a warning.
    pub fn from_map(config_map: &HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let get_str = |key: &str, default: &str| -> String {
            config_map
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let get_opt = |key: &str| -> Option<String> {
            config_map
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let max_batch_size: usize = parse_or(config_map, "MAX_BATCH_SIZE", 50);
        if max_batch_size == 0 {
            anyhow::bail!("MAX_BATCH_SIZE must be at least 1");
        }

        Ok(AppConfig {
            server: ServerConfig {
                host: get_str("SERVER_HOST", "127.0.0.1"),
                port: parse_or(config_map, "SERVER_PORT", 8080),
            },
            database_url: get_opt("DATABASE_URL"),
            sessions: SessionConfig {
                max_batch_size,
                store_timeout: Duration::from_millis(parse_or(config_map, "STORE_TIMEOUT_MS", 5000)),
                package_interval_days: parse_or(config_map, "PACKAGE_INTERVAL_DAYS", 7),
            },
            side_effect_timeout: Duration::from_millis(parse_or(config_map, "SIDE_EFFECT_TIMEOUT_MS", 3000)),
            notifications: NotificationConfig {
                live_channel_capacity: parse_or(config_map, "LIVE_CHANNEL_CAPACITY", 64),
                push_endpoint: get_opt("PUSH_ENDPOINT"),
                push_server_key: get_opt("PUSH_SERVER_KEY"),
            },
            file_storage_root: get_str("FILE_STORAGE_ROOT", "./data/uploads"),
            roster_file: get_opt("ROSTER_FILE"),
        })
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            max_batch_size: self.sessions.max_batch_size,
            store_timeout: self.sessions.store_timeout,
            package_interval_days: self.sessions.package_interval_days,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(config_map: &HashMap<String, String>, key: &str, default: T) -> T {
    match config_map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid value {:?} for {}, using default {}", raw, key, default);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_map(&HashMap::new()).expect("config");
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert!(config.database_url.is_none());
        assert_eq!(config.sessions.max_batch_size, 50);
        assert_eq!(config.sessions.store_timeout, Duration::from_millis(5000));
        assert_eq!(config.side_effect_timeout, Duration::from_millis(3000));
        assert_eq!(config.sessions.package_interval_days, 7);
        assert_eq!(config.notifications.live_channel_capacity, 64);
        assert!(config.notifications.push_credentials().is_none());
        assert_eq!(config.file_storage_root, "./data/uploads");
        assert!(config.roster_file.is_none());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = AppConfig::from_map(&map(&[
            ("SERVER_PORT", "9090"),
            ("DATABASE_URL", "postgres://clinic@localhost/careline"),
            ("MAX_BATCH_SIZE", "12"),
            ("STORE_TIMEOUT_MS", "soon"),
            ("PUSH_ENDPOINT", "https://push.example.com/send"),
            ("PUSH_SERVER_KEY", "k"),
        ]))
        .expect("config");

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.database_url.as_deref(), Some("postgres://clinic@localhost/careline"));
        assert_eq!(config.lifecycle().max_batch_size, 12);
        assert_eq!(config.sessions.store_timeout, Duration::from_millis(5000));
        assert_eq!(
            config.notifications.push_credentials(),
            Some(("https://push.example.com/send", "k"))
        );
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(AppConfig::from_map(&map(&[("MAX_BATCH_SIZE", "0")])).is_err());
    }
}
