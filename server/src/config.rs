//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Bearer token devices must present; unset accepts any token
    pub auth_secret: Option<String>,
    /// Upper bound on changes in one push request
    pub max_push_changes: usize,
    pub max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        let max_push_changes = parse_var("MAX_PUSH_CHANGES", 500)?;
        let max_connections = parse_var("DATABASE_MAX_CONNECTIONS", 10)?;

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            max_push_changes,
            max_connections,
        })
    }

    /// Configuration for tests and local tooling.
    pub fn local(database_url: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_url: database_url.into(),
            auth_secret: None,
            max_push_changes: 500,
            max_connections: 10,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}
