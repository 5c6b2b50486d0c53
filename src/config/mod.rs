//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::game::ReconnectPolicy;

/// Durable store connection settings
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// PostgREST base URL
    pub url: String,
    /// Service key (server only!)
    pub key: String,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated)
    pub client_origin: String,

    /// Digits in a join code
    pub join_code_length: usize,
    /// Whether a vacated player slot may be rejoined
    pub reconnect_policy: ReconnectPolicy,
    /// How long a game with no live connections waits before it is abandoned
    pub abandon_grace: Duration,
    /// How long a game nobody is connected to survives before it is swept
    pub idle_timeout: Duration,

    /// Durable store; in-memory when absent
    pub store: Option<StoreConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            client_origin: "http://localhost:3000".to_string(),
            join_code_length: 6,
            reconnect_policy: ReconnectPolicy::Allow,
            abandon_grace: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            store: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| defaults.server_addr.to_string())
        };

        let join_code_length = match env::var("JOIN_CODE_LENGTH") {
            Ok(raw) => parse_code_length(&raw)?,
            Err(_) => defaults.join_code_length,
        };

        let reconnect_policy = match env::var("ALLOW_RECONNECT") {
            Ok(raw) => parse_reconnect(&raw)?,
            Err(_) => defaults.reconnect_policy,
        };

        let abandon_grace = match env::var("ABANDON_GRACE_SECS") {
            Ok(raw) => parse_secs(&raw, "ABANDON_GRACE_SECS")?,
            Err(_) => defaults.abandon_grace,
        };

        let idle_timeout = match env::var("IDLE_GAME_TIMEOUT_SECS") {
            Ok(raw) => parse_secs(&raw, "IDLE_GAME_TIMEOUT_SECS")?,
            Err(_) => defaults.idle_timeout,
        };

        let store = match (env::var("STORE_URL"), env::var("STORE_KEY")) {
            (Ok(url), Ok(key)) => Some(StoreConfig { url, key }),
            (Ok(_), Err(_)) => return Err(ConfigError::Missing("STORE_KEY")),
            (Err(_), _) => None,
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or(defaults.client_origin),
            join_code_length,
            reconnect_policy,
            abandon_grace,
            idle_timeout,
            store,
        })
    }
}

fn parse_code_length(raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(len) if (4..=9).contains(&len) => Ok(len),
        _ => Err(ConfigError::Invalid("JOIN_CODE_LENGTH")),
    }
}

fn parse_secs(raw: &str, var: &'static str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::Invalid(var))
}

fn parse_reconnect(raw: &str) -> Result<ReconnectPolicy, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(ReconnectPolicy::Allow),
        "0" | "false" | "no" => Ok(ReconnectPolicy::Deny),
        _ => Err(ConfigError::Invalid("ALLOW_RECONNECT")),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
