//! Environment configuration of the notifier.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::watcher::WatcherConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub db_url: String,
    pub bus_url: String,
    pub auth_secret: String,
    pub http_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    pub ready_addr: SocketAddr,
    pub consumer_group: String,
    /// Stable per replica so pending messages are re-read after a restart.
    pub consumer_name: String,
    pub watcher: WatcherConfig,
}

impl NotifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unknown variables are never consulted.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| lookup(name).filter(|v| !v.is_empty()).ok_or(ConfigError::Missing(name));
        let addr = |name: &'static str, default: &str| -> Result<SocketAddr, ConfigError> {
            let raw = lookup(name).unwrap_or_else(|| default.to_string());
            raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        };
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                    name,
                    reason: e.to_string(),
                }),
            }
        };

        Ok(Self {
            db_url: required("MDS_DB_URL")?,
            bus_url: required("MDS_BUS_URL")?,
            auth_secret: required("MDS_AUTH_SECRET")?,
            http_addr: addr("MDS_HTTP_ADDR", "0.0.0.0:8080")?,
            ws_addr: addr("MDS_WS_ADDR", "0.0.0.0:8081")?,
            ready_addr: addr("MDS_READY_ADDR", "0.0.0.0:8082")?,
            consumer_group: lookup("MDS_CONSUMER_GROUP")
                .unwrap_or_else(|| "open-intel-delivery-notifier".to_string()),
            consumer_name: lookup("HOSTNAME").unwrap_or_else(|| "local".to_string()),
            watcher: WatcherConfig {
                periodic_interval: Duration::from_secs(number("MDS_WATCHER_PERIODIC_SECS", 5)?),
                notify_delay: Duration::from_millis(number("MDS_WATCHER_NOTIFY_DELAY_MS", 100)?),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("MDS_DB_URL", "postgres://localhost/mds"),
        ("MDS_BUS_URL", "redis://localhost:6379"),
        ("MDS_AUTH_SECRET", "secret"),
    ];

    #[test]
    fn defaults_apply() {
        let config = NotifierConfig::from_lookup(env(&REQUIRED)).unwrap();
        assert_eq!(config.ws_addr, "0.0.0.0:8081".parse().unwrap());
        assert_eq!(config.consumer_group, "open-intel-delivery-notifier");
        assert_eq!(config.watcher.notify_delay, Duration::from_millis(100));
        assert_eq!(config.watcher.periodic_interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_required_variable_fails() {
        let err = NotifierConfig::from_lookup(env(&REQUIRED[..2])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("MDS_AUTH_SECRET"));
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MDS_WATCHER_NOTIFY_DELAY_MS", "soon"));
        let err = NotifierConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MDS_WATCHER_NOTIFY_DELAY_MS", .. }));
    }
}
