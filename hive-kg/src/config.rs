//! Configuration for the graph connection and the resilience layer
//!
//! Values come from `NEO4J_*` environment variables, optionally loaded from a
//! `.env` file. Anything unset falls back to the defaults of the individual
//! component configs.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{Neo4jError, Result};
use crate::pool::SessionPoolConfig;
use crate::transaction::TransactionDefaults;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgConfig {
    /// Neo4j connection URI (e.g., "bolt://localhost:7687")
    pub uri: String,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    #[serde(skip_serializing)]
    pub password: String,
    /// Database name
    pub database: String,
    /// Number of records fetched per round-trip
    pub fetch_size: usize,
    /// Session pool sizing and timeouts
    pub pool: SessionPoolConfig,
    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
    /// Process-wide transaction defaults
    pub transaction: TransactionDefaults,
}

impl Default for KgConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: "neo4j".to_string(),
            fetch_size: 500,
            pool: SessionPoolConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            transaction: TransactionDefaults::default(),
        }
    }
}

impl KgConfig {
    /// Load configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded environment from .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str, default: String| lookup(key).unwrap_or(default);

        let mut config = Self {
            uri: get("NEO4J_URI", defaults.uri),
            user: get("NEO4J_USER", defaults.user),
            password: get("NEO4J_PASSWORD", defaults.password),
            database: get("NEO4J_DATABASE", defaults.database),
            fetch_size: parse_or(&lookup, "NEO4J_FETCH_SIZE", defaults.fetch_size)?,
            ..defaults
        };

        config.pool.max_pool_size =
            parse_or(&lookup, "NEO4J_MAX_POOL_SIZE", config.pool.max_pool_size)?;
        config.pool.min_pool_size =
            parse_or(&lookup, "NEO4J_MIN_POOL_SIZE", config.pool.min_pool_size)?;
        config.pool.acquire_timeout =
            millis_or(&lookup, "NEO4J_ACQUIRE_TIMEOUT_MS", config.pool.acquire_timeout)?;
        config.transaction.timeout =
            millis_or(&lookup, "NEO4J_TX_TIMEOUT_MS", config.transaction.timeout)?;
        config.transaction.retry_strategy.max_retries = parse_or(
            &lookup,
            "NEO4J_MAX_RETRIES",
            config.transaction.retry_strategy.max_retries,
        )?;
        config.circuit_breaker.failure_threshold = parse_or(
            &lookup,
            "NEO4J_CB_FAILURE_THRESHOLD",
            config.circuit_breaker.failure_threshold,
        )?;
        config.circuit_breaker.recovery_timeout = millis_or(
            &lookup,
            "NEO4J_CB_RECOVERY_TIMEOUT_MS",
            config.circuit_breaker.recovery_timeout,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(Neo4jError::ConfigError("uri must not be empty".to_string()));
        }
        if self.fetch_size == 0 {
            return Err(Neo4jError::ConfigError(
                "fetch_size must be greater than 0".to_string(),
            ));
        }

        self.pool.validate()?;
        self.circuit_breaker.validate()?;
        self.transaction.validate()?;
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Neo4jError::ConfigError(format!("invalid {}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let millis = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = KgConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.uri, "bolt://localhost:7687");
        assert_eq!(config.fetch_size, 500);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = KgConfig::from_lookup(lookup_from(&[
            ("NEO4J_URI", "bolt://graph:7687"),
            ("NEO4J_MAX_POOL_SIZE", "8"),
            ("NEO4J_ACQUIRE_TIMEOUT_MS", "250"),
            ("NEO4J_MAX_RETRIES", "5"),
            ("NEO4J_CB_FAILURE_THRESHOLD", "7"),
        ]))
        .unwrap();

        assert_eq!(config.uri, "bolt://graph:7687");
        assert_eq!(config.user, "neo4j");
        assert_eq!(config.pool.max_pool_size, 8);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.transaction.retry_strategy.max_retries, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 7);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = KgConfig::from_lookup(lookup_from(&[("NEO4J_MAX_POOL_SIZE", "lots")]));
        assert!(matches!(result, Err(Neo4jError::ConfigError(_))));
    }

    #[test]
    fn test_from_lookup_runs_validation() {
        let result = KgConfig::from_lookup(lookup_from(&[
            ("NEO4J_MAX_POOL_SIZE", "2"),
            ("NEO4J_MIN_POOL_SIZE", "4"),
        ]));
        assert!(matches!(result, Err(Neo4jError::ConfigError(_))));
    }
}
