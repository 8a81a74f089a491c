use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use thiserror::Error;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub import_reconnect_interval_ms: u64,
    pub status_interval_secs: u64,
    pub disabled_startup_scripts: Vec<String>,
    pub log_level: String,
    /// Broker that receives the host's online/offline status, if any.
    pub status_broker_server: Option<String>,
    pub status_broker_port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            import_reconnect_interval_ms: 30_000,
            status_interval_secs: 30,
            disabled_startup_scripts: Vec::new(),
            log_level: "info".to_string(),
            status_broker_server: None,
            status_broker_port: 1883,
        }
    }
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.import_reconnect_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "IMPORT_RECONNECT_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if self.status_interval_secs == 0 {
            return Err(ConfigError::ParsingError(
                "STATUS_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            import_reconnect_interval_ms: match lookup("IMPORT_RECONNECT_INTERVAL_MS") {
                Some(value) => value.trim().parse::<u64>().map_err(|_| {
                    ConfigError::ParsingError(
                        "IMPORT_RECONNECT_INTERVAL_MS must be a valid number".to_string(),
                    )
                })?,
                None => defaults.import_reconnect_interval_ms,
            },
            status_interval_secs: match lookup("STATUS_INTERVAL_SECS") {
                Some(value) => value.trim().parse::<u64>().map_err(|_| {
                    ConfigError::ParsingError("STATUS_INTERVAL_SECS must be a valid number".to_string())
                })?,
                None => defaults.status_interval_secs,
            },
            disabled_startup_scripts: lookup("DISABLED_STARTUP_SCRIPTS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|uid| !uid.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            log_level: match lookup("LOG_LEVEL") {
                Some(value) => {
                    let level = value.trim().to_lowercase();
                    if !LOG_LEVELS.contains(&level.as_str()) {
                        return Err(ConfigError::MissingOrInvalid("LOG_LEVEL".to_string()));
                    }
                    level
                }
                None => defaults.log_level,
            },
            status_broker_server: lookup("STATUS_BROKER_SERVER")
                .map(|value| value.trim().to_string())
                .filter(|server| !server.is_empty()),
            status_broker_port: match lookup("STATUS_BROKER_PORT") {
                Some(value) => value
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port > 0)
                    .ok_or_else(|| {
                        ConfigError::ParsingError("STATUS_BROKER_PORT must be a port between 1 and 65535".to_string())
                    })?,
                None => defaults.status_broker_port,
            },
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn is_startup_script_enabled(&self, uid: &str) -> bool {
        !self.disabled_startup_scripts.iter().any(|disabled| disabled == uid)
    }
}
