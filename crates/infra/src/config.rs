//! Scheduler configuration.
//!
//! Every setting has a default and can be overridden through a `CADENCE_*`
//! environment variable. Unparseable values are logged and replaced by the
//! default rather than aborting startup.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use cadence_core::ConfigId;

use crate::dispatcher::DispatcherSettings;
use crate::producer::ProducerSettings;
use crate::reaper::ReaperSettings;
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::runner::LoopSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Watermark record this node produces for.
    pub config_id: ConfigId,
    pub producer_interval: Duration,
    pub max_history: Option<Duration>,
    pub max_cas_retries: u32,

    pub dispatch_interval: Duration,
    pub batch_size: usize,
    /// Total executions allowed per job.
    pub max_retries: u32,
    pub retry_strategy: BackoffStrategy,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    pub workers: usize,
    /// Store connection pool size; `workers + 4` when unset.
    pub db_max_connections: Option<u32>,

    pub reaper_interval: Duration,
    pub stale_after: Duration,

    /// Consecutive unavailable-store failures before a service reports not-live.
    pub unavailable_threshold: u32,
    pub store_backoff_base: Duration,
    pub store_backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            config_id: ConfigId::from_raw("1"),
            producer_interval: Duration::from_secs(1),
            max_history: None,
            max_cas_retries: 5,
            dispatch_interval: Duration::from_millis(500),
            batch_size: 100,
            max_retries: 3,
            retry_strategy: BackoffStrategy::Exponential,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            workers: 4,
            db_max_connections: None,
            reaper_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
            unavailable_threshold: 5,
            store_backoff_base: Duration::from_millis(500),
            store_backoff_max: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup` (variable name -> value).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let ms = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_millis() as u64).map_or(default, Duration::from_millis)
        };

        let mut config = Self {
            config_id: lookup("CADENCE_CONFIG_ID")
                .and_then(|raw| match raw.parse::<ConfigId>() {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(key = "CADENCE_CONFIG_ID", error = %e, "invalid config id; using default");
                        None
                    }
                })
                .unwrap_or(d.config_id),
            producer_interval: ms("CADENCE_PRODUCER_INTERVAL_MS", d.producer_interval),
            max_history: lookup("CADENCE_MAX_HISTORY_MS")
                .and_then(|raw| parse_value::<u64>("CADENCE_MAX_HISTORY_MS", &raw))
                .map(Duration::from_millis),
            max_cas_retries: parse_or(&lookup, "CADENCE_MAX_CAS_RETRIES", d.max_cas_retries)
                .unwrap_or(d.max_cas_retries),
            dispatch_interval: ms("CADENCE_DISPATCH_INTERVAL_MS", d.dispatch_interval),
            batch_size: parse_or(&lookup, "CADENCE_BATCH_SIZE", d.batch_size).unwrap_or(d.batch_size),
            max_retries: parse_or(&lookup, "CADENCE_MAX_RETRIES", d.max_retries).unwrap_or(d.max_retries),
            retry_strategy: parse_or(&lookup, "CADENCE_RETRY_BACKOFF", d.retry_strategy)
                .unwrap_or(d.retry_strategy),
            retry_base_delay: ms("CADENCE_RETRY_BASE_MS", d.retry_base_delay),
            retry_max_delay: ms("CADENCE_RETRY_MAX_MS", d.retry_max_delay),
            workers: parse_or(&lookup, "CADENCE_WORKERS", d.workers).unwrap_or(d.workers),
            db_max_connections: lookup("CADENCE_DB_MAX_CONNECTIONS")
                .and_then(|raw| parse_value::<u32>("CADENCE_DB_MAX_CONNECTIONS", &raw)),
            reaper_interval: ms("CADENCE_REAPER_INTERVAL_MS", d.reaper_interval),
            stale_after: ms("CADENCE_STALE_AFTER_MS", d.stale_after),
            unavailable_threshold: parse_or(&lookup, "CADENCE_UNAVAILABLE_THRESHOLD", d.unavailable_threshold)
                .unwrap_or(d.unavailable_threshold),
            store_backoff_base: ms("CADENCE_STORE_BACKOFF_BASE_MS", d.store_backoff_base),
            store_backoff_max: ms("CADENCE_STORE_BACKOFF_MAX_MS", d.store_backoff_max),
        };

        config.clamp();
        config
    }

    fn clamp(&mut self) {
        if self.workers == 0 {
            warn!("CADENCE_WORKERS must be at least 1; using 1");
            self.workers = 1;
        }
        if self.max_retries == 0 {
            warn!("CADENCE_MAX_RETRIES must be at least 1; using 1");
            self.max_retries = 1;
        }
        if self.batch_size == 0 {
            warn!("CADENCE_BATCH_SIZE must be at least 1; using 1");
            self.batch_size = 1;
        }
        if self.db_max_connections == Some(0) {
            warn!("CADENCE_DB_MAX_CONNECTIONS must be at least 1; using default");
            self.db_max_connections = None;
        }
        if self.retry_max_delay < self.retry_base_delay {
            self.retry_max_delay = self.retry_base_delay;
        }
    }

    /// Connections for the store pool: every worker and service loop can hold one.
    pub fn db_pool_size(&self) -> u32 {
        self.db_max_connections
            .unwrap_or_else(|| u32::try_from(self.workers).unwrap_or(u32::MAX).saturating_add(4))
    }

    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            config_id: self.config_id.clone(),
            max_history: self.max_history,
            max_cas_retries: self.max_cas_retries,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.retry_base_delay, self.retry_max_delay)
            .with_strategy(self.retry_strategy)
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            batch_size: self.batch_size,
            retry: self.retry_policy(),
        }
    }

    pub fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings {
            stale_after: self.stale_after,
            max_attempts: self.max_retries,
            batch_size: self.batch_size,
        }
    }

    /// Loop timing for a service ticking every `interval`.
    pub fn loop_settings(&self, interval: Duration) -> LoopSettings {
        LoopSettings {
            interval,
            backoff: RetryPolicy::exponential(u32::MAX, self.store_backoff_base, self.store_backoff_max),
            unavailable_threshold: self.unavailable_threshold.max(1),
        }
    }
}

/// `Some(value)` when set and valid, `Some(default)` when unset, `None` when invalid.
fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Some(default),
        Some(raw) => parse_value(key, &raw),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = raw, error = %e, "invalid value; using default");
            None
        }
    }
}
