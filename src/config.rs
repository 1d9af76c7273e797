use std::{net::SocketAddr, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricBackend {
    /// Fanout stays inside this process.
    Memory,
    /// Fanout goes through Redis pub/sub so every gateway process sees every publish.
    Redis { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub handshake_timeout: Duration,
    pub fabric: FabricBackend,
    pub fabric_channel_prefix: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Reads the process environment, with `.env` taken into account.
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());

        let fabric = match get("FABRIC", "memory").to_ascii_lowercase().as_str() {
            "memory" => FabricBackend::Memory,
            "redis" => FabricBackend::Redis { url: get("REDIS_URL", "redis://127.0.0.1/") },
            other => return Err(ConfigError::Invalid { key: "FABRIC", value: other.to_owned() }),
        };

        let log_format = match get("LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::Invalid { key: "LOG_FORMAT", value: other.to_owned() });
            }
        };

        Ok(Config {
            database_url: get("DATABASE_URL", "sqlite://roomchat.db"),
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", 16)?,
            bind_addr: parse(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            jwt_secret: lookup("JWT_SECRET")
                .filter(|secret| !secret.is_empty())
                .ok_or(ConfigError::Missing("JWT_SECRET"))?,
            handshake_timeout: Duration::from_secs(parse(&lookup, "HANDSHAKE_TIMEOUT_SECS", 10)?),
            fabric,
            fabric_channel_prefix: get("FABRIC_CHANNEL_PREFIX", "roomchat.room"),
            log_format,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}
