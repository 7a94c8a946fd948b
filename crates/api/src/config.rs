//! Application configuration loaded from environment variables.

use std::time::Duration;

use locking::LockConfig;
use notifications::{ConsumerConfig, RedeliveryPolicy, RelayConfig, RetentionConfig};
use payments::ReconcilerConfig;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server and worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for human-readable output
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory store when unset
/// - `REDIS_URL`: Redis connection string for locks; in-memory locks when unset
/// - `LOCK_TTL_MS` (3000), `RELAY_INTERVAL_MS` (1000), `RELAY_BATCH_SIZE` (100),
///   `DELIVERY_CEILING` (5), `REDELIVERY_BACKOFF_MS` (500),
///   `RECONCILE_INTERVAL_SECS` (300), `PAYMENT_STALE_AFTER_SECS` (1800),
///   `OUTBOX_RETENTION_DAYS` (30)
///
/// Unparseable numeric values fall back to their defaults, as do zero
/// durations and batch sizes. `REDELIVERY_BACKOFF_MS` may be zero.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub lock_ttl: Duration,
    pub relay_interval: Duration,
    pub relay_batch_size: usize,
    pub delivery_ceiling: u32,
    pub redelivery_backoff: Duration,
    pub reconcile_interval: Duration,
    pub payment_stale_after: Duration,
    pub outbox_retention: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str, default: u64| -> u64 {
            lookup(name)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        // Zero would disable locking or stall a worker, so it falls back too.
        let positive = |name: &str, default: u64| -> u64 {
            match number(name, default) {
                0 => default,
                v => v,
            }
        };
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT") {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            lock_ttl: Duration::from_millis(positive("LOCK_TTL_MS", 3000)),
            relay_interval: Duration::from_millis(positive("RELAY_INTERVAL_MS", 1000)),
            relay_batch_size: positive("RELAY_BATCH_SIZE", 100) as usize,
            delivery_ceiling: number("DELIVERY_CEILING", 5).clamp(1, u32::MAX as u64) as u32,
            redelivery_backoff: Duration::from_millis(number("REDELIVERY_BACKOFF_MS", 500)),
            reconcile_interval: Duration::from_secs(positive("RECONCILE_INTERVAL_SECS", 300)),
            payment_stale_after: Duration::from_secs(positive("PAYMENT_STALE_AFTER_SECS", 1800)),
            outbox_retention: Duration::from_secs(positive("OUTBOX_RETENTION_DAYS", 30) * DAY_SECS),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            ttl: self.lock_ttl,
            ..LockConfig::default()
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            interval: self.relay_interval,
            batch_size: self.relay_batch_size,
            ..RelayConfig::default()
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::default()
    }

    /// Broker redelivery bounded by the same ceiling the dead-letter
    /// reconciler charges against.
    pub fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_deliveries: self.delivery_ceiling,
            initial_backoff: self.redelivery_backoff,
            ..RedeliveryPolicy::default()
        }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            retention: self.outbox_retention,
            ..RetentionConfig::default()
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            stale_after: self.payment_stale_after,
        }
    }
}

const DAY_SECS: u64 = 24 * 60 * 60;

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            redis_url: None,
            lock_ttl: Duration::from_millis(3000),
            relay_interval: Duration::from_millis(1000),
            relay_batch_size: 100,
            delivery_ceiling: notifications::DEFAULT_DELIVERY_CEILING,
            redelivery_backoff: Duration::from_millis(500),
            reconcile_interval: Duration::from_secs(300),
            payment_stale_after: Duration::from_secs(1800),
            outbox_retention: Duration::from_secs(30 * DAY_SECS),
        }
    }
}
