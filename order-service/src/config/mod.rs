use std::str::FromStr;
use thiserror::Error;

/// Service configuration, loaded from the environment.
///
/// `DB_DSN` and `BROKER_ADDR` are required; everything else has a default.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Ingress listen port (`APP_PORT`)
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection string (`DB_DSN`)
    pub dsn: String,
    /// Pool size (`DB_MAX_CONNECTIONS`)
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker endpoint (`BROKER_ADDR`)
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay poll interval in milliseconds (`POLL_INTERVAL_MS`)
    pub poll_interval_ms: u64,
    /// Rows drained per tick (`BATCH_SIZE`)
    pub batch_size: i64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// In-delivery handler attempts (`MAX_RETRIES`)
    pub max_retries: u32,
    /// Sleep between attempts in milliseconds (`RETRY_BACKOFF_MS`)
    pub retry_backoff_ms: u64,
    /// Counters snapshot period in milliseconds (`METRICS_INTERVAL_MS`)
    pub metrics_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 10,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 1000,
            metrics_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            app: AppConfig {
                port: parse_or("APP_PORT", 3000)?,
            },
            database: DatabaseConfig {
                dsn: required("DB_DSN")?,
                max_connections: parse_or("DB_MAX_CONNECTIONS", 10)?,
            },
            broker: BrokerConfig {
                addr: required("BROKER_ADDR")?,
            },
            relay: RelayConfig {
                poll_interval_ms: parse_or("POLL_INTERVAL_MS", 1000)?,
                batch_size: parse_or("BATCH_SIZE", 10)?,
            },
            worker: WorkerConfig {
                max_retries: parse_or("MAX_RETRIES", 3)?,
                retry_backoff_ms: parse_or("RETRY_BACKOFF_MS", 1000)?,
                metrics_interval_ms: parse_or("METRICS_INTERVAL_MS", 10_000)?,
            },
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse::<T>().map_err(|_| ConfigError::Invalid {
            name,
            value: v.clone(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_defaults() {
        let relay = RelayConfig::default();
        assert_eq!(relay.poll_interval_ms, 1000);
        assert_eq!(relay.batch_size, 10);
    }

    #[test]
    fn test_worker_defaults() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.max_retries, 3);
        assert_eq!(worker.retry_backoff_ms, 1000);
        assert_eq!(worker.metrics_interval_ms, 10_000);
    }
}
