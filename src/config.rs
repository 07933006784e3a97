use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_DB: &str = "log-monitor.db";
const DEFAULT_FETCH_LIMIT: usize = 1000;
const DEFAULT_BODY_LIMIT: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid socket address: {value:?}")]
    InvalidAddr { var: &'static str, value: String },
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Service configuration, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub database_path: PathBuf,
    /// Row cap for the event query endpoint.
    pub fetch_limit: usize,
    /// Maximum accepted request body in bytes.
    pub body_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            database_path: PathBuf::from(DEFAULT_DB),
            fetch_limit: DEFAULT_FETCH_LIMIT,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr_var = "LOG_MONITOR_ADDR";
        let addr_value = lookup(addr_var).unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr_value
            .parse()
            .map_err(|_| ConfigError::InvalidAddr {
                var: addr_var,
                value: addr_value.clone(),
            })?;

        let database_path = lookup("LOG_MONITOR_DB")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));

        Ok(Self {
            addr,
            database_path,
            fetch_limit: positive(&lookup, "LOG_MONITOR_FETCH_LIMIT", DEFAULT_FETCH_LIMIT)?,
            body_limit: positive(&lookup, "LOG_MONITOR_BODY_LIMIT", DEFAULT_BODY_LIMIT)?,
        })
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::InvalidNumber { var, value }),
        },
    }
}
