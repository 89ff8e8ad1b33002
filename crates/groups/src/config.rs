//! Environment configuration of the group service.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub db_url: String,
    pub bus_url: String,
    pub search_host: String,
    pub search_master_key: String,
    pub http_addr: SocketAddr,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Enqueue a rebuild of the groups index at start-up.
    pub rebuild_search_index: bool,
}

impl GroupConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| lookup(name).filter(|v| !v.is_empty()).ok_or(ConfigError::Missing(name));

        let raw_addr = lookup("MDS_HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let http_addr = raw_addr.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            name: "MDS_HTTP_ADDR",
            reason: e.to_string(),
        })?;

        let rebuild_search_index = match lookup("MDS_REBUILD_SEARCH_INDEX").as_deref() {
            None | Some("") | Some("false") | Some("0") => false,
            Some("true") | Some("1") => true,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "MDS_REBUILD_SEARCH_INDEX",
                    reason: format!("expected true or false, got '{other}'"),
                })
            }
        };

        Ok(Self {
            db_url: required("MDS_DB_URL")?,
            bus_url: required("MDS_BUS_URL")?,
            search_host: required("MDS_SEARCH_HOST")?,
            search_master_key: required("MDS_SEARCH_MASTER_KEY")?,
            http_addr,
            consumer_group: lookup("MDS_CONSUMER_GROUP").unwrap_or_else(|| "group-service".to_string()),
            consumer_name: lookup("HOSTNAME").unwrap_or_else(|| "local".to_string()),
            rebuild_search_index,
        })
    }
}
