//! Typed configuration from environment variables.
//!
//! Loads once at startup with documented defaults; interval overrides
//! are plain seconds. The store connection string is wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::time::Duration;

use secrecy::SecretString;

use crate::aggregator::AggregatorOptions;
use crate::collections::CollectionOptions;
use crate::error::{Error, Result};
use crate::lock::LockOptions;
use crate::queue::QueueOptions;
use crate::sweeper::SweeperOptions;

#[derive(Debug)]
pub struct Config {
    /// Postgres connection string; absent when running on the in-memory
    /// store.
    pub database_url: Option<SecretString>,

    /// Sleep between dequeue visibility scans. Default 2s.
    pub queue_poll_interval: Duration,
    /// Unrenewed-lease reclaim age. Default 15min.
    pub invisibility_window: Duration,
    /// Open-lease renewal cadence. Default 5min.
    pub lease_heartbeat_interval: Duration,

    /// Lock wait used where the caller does not pick one. Default 60s.
    pub default_lock_timeout: Duration,
    /// Sleep between contended lock attempts. Default 2s.
    pub lock_backoff: Duration,
    /// TTL margin above the lock hold. Default 15s.
    pub lock_ttl_grace: Duration,

    /// Host scheduling hint: how often to run the sweeper. Default 30min.
    pub expiration_check_interval: Duration,
    /// Host scheduling hint: how often to run the aggregator. Default 2min.
    pub counter_aggregate_interval: Duration,
    /// Lock wait for maintenance components. Default 5min.
    pub maintenance_lock_timeout: Duration,

    /// Bounded page size per store call. Default 100.
    pub page_size: usize,

    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            queue_poll_interval: Duration::from_secs(2),
            invisibility_window: Duration::from_secs(15 * 60),
            lease_heartbeat_interval: Duration::from_secs(5 * 60),
            default_lock_timeout: Duration::from_secs(60),
            lock_backoff: Duration::from_secs(2),
            lock_ttl_grace: Duration::from_secs(15),
            expiration_check_interval: Duration::from_secs(30 * 60),
            counter_aggregate_interval: Duration::from_secs(2 * 60),
            maintenance_lock_timeout: Duration::from_secs(5 * 60),
            page_size: 100,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            queue_poll_interval: duration_var("CORRAL_QUEUE_POLL_SECS", defaults.queue_poll_interval)?,
            invisibility_window: duration_var(
                "CORRAL_INVISIBILITY_WINDOW_SECS",
                defaults.invisibility_window,
            )?,
            lease_heartbeat_interval: duration_var(
                "CORRAL_LEASE_HEARTBEAT_SECS",
                defaults.lease_heartbeat_interval,
            )?,
            default_lock_timeout: duration_var(
                "CORRAL_LOCK_TIMEOUT_SECS",
                defaults.default_lock_timeout,
            )?,
            lock_backoff: duration_var("CORRAL_LOCK_BACKOFF_SECS", defaults.lock_backoff)?,
            lock_ttl_grace: duration_var("CORRAL_LOCK_TTL_GRACE_SECS", defaults.lock_ttl_grace)?,
            expiration_check_interval: duration_var(
                "CORRAL_EXPIRATION_CHECK_SECS",
                defaults.expiration_check_interval,
            )?,
            counter_aggregate_interval: duration_var(
                "CORRAL_COUNTER_AGGREGATE_SECS",
                defaults.counter_aggregate_interval,
            )?,
            maintenance_lock_timeout: duration_var(
                "CORRAL_MAINTENANCE_LOCK_TIMEOUT_SECS",
                defaults.maintenance_lock_timeout,
            )?,
            page_size: defaults.page_size,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            poll_interval: self.queue_poll_interval,
            invisibility_window: self.invisibility_window,
            heartbeat_interval: self.lease_heartbeat_interval,
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            backoff: self.lock_backoff,
            ttl_grace: self.lock_ttl_grace,
        }
    }

    pub fn sweeper_options(&self) -> SweeperOptions {
        SweeperOptions {
            lock_timeout: self.maintenance_lock_timeout,
            page_size: self.page_size,
        }
    }

    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            lock_timeout: self.maintenance_lock_timeout,
            page_size: self.page_size,
        }
    }

    pub fn collection_options(&self) -> CollectionOptions {
        CollectionOptions {
            merge_lock_timeout: self.default_lock_timeout,
        }
    }
}

fn duration_var(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{name} must be a whole number of seconds"))),
        Err(_) => Ok(default),
    }
}
