//! Task manager configuration.
//!
//! Values arrive from an external resolver (JSON) or the environment. Bad
//! values never abort startup: each one is logged and replaced with its
//! default.

use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

pub const ENV_STORE_MAX_SIZE: &str = "SPOOL_STORE_MAX_SIZE";
pub const ENV_STORE_TTL: &str = "SPOOL_STORE_TTL";
pub const ENV_CLEANUP_INTERVAL: &str = "SPOOL_CLEANUP_INTERVAL";
pub const ENV_MAX_CONCURRENT: &str = "SPOOL_MAX_CONCURRENT";
pub const ENV_PROCESSING_TIMEOUT: &str = "SPOOL_PROCESSING_TIMEOUT";
pub const ENV_MAX_WORKERS_PER_PARTITION: &str = "SPOOL_MAX_WORKERS_PER_PARTITION";

/// Tunables for the store, limiter, janitor and worker pools.
///
/// Durations are (de)serialized as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Maximum number of task records kept in memory.
    pub store_max_size: usize,
    /// How long completed/failed records are kept.
    #[serde(with = "secs")]
    pub store_ttl: Duration,
    /// Pause between janitor sweeps.
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
    /// Global cap on callbacks running at once.
    pub max_concurrent: usize,
    /// Per-callback time budget.
    #[serde(with = "secs")]
    pub processing_timeout: Duration,
    pub max_workers_per_partition: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            store_max_size: 1000,
            store_ttl: Duration::from_secs(3600),       // 1 hour
            cleanup_interval: Duration::from_secs(300), // 5 minutes
            max_concurrent: 10,
            processing_timeout: Duration::from_secs(300),
            max_workers_per_partition: 5,
        }
    }
}

impl TaskConfig {
    /// Read overrides from `SPOOL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse the JSON handed over by the configuration resolver.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            store_max_size: read(&lookup, ENV_STORE_MAX_SIZE, d.store_max_size),
            store_ttl: Duration::from_secs(read(&lookup, ENV_STORE_TTL, d.store_ttl.as_secs())),
            cleanup_interval: Duration::from_secs(read(
                &lookup,
                ENV_CLEANUP_INTERVAL,
                d.cleanup_interval.as_secs(),
            )),
            max_concurrent: read(&lookup, ENV_MAX_CONCURRENT, d.max_concurrent),
            processing_timeout: Duration::from_secs(read(
                &lookup,
                ENV_PROCESSING_TIMEOUT,
                d.processing_timeout.as_secs(),
            )),
            max_workers_per_partition: read(
                &lookup,
                ENV_MAX_WORKERS_PER_PARTITION,
                d.max_workers_per_partition,
            ),
        }
    }

    /// Replace every zero value with its default.
    pub fn validated(self) -> Self {
        let d = Self::default();
        let mut c = self;
        ensure_positive("store_max_size", &mut c.store_max_size, d.store_max_size);
        ensure_positive("store_ttl", &mut c.store_ttl, d.store_ttl);
        ensure_positive("cleanup_interval", &mut c.cleanup_interval, d.cleanup_interval);
        ensure_positive("max_concurrent", &mut c.max_concurrent, d.max_concurrent);
        ensure_positive("processing_timeout", &mut c.processing_timeout, d.processing_timeout);
        ensure_positive(
            "max_workers_per_partition",
            &mut c.max_workers_per_partition,
            d.max_workers_per_partition,
        );
        c
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> T
where
    T: FromStr + Debug,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            let err = ConfigError::InvalidValue {
                key,
                message: format!("cannot parse '{raw}'"),
            };
            warn!(error = %err, fallback = ?default, "using default task setting");
            default
        }
    }
}

fn ensure_positive<T>(key: &'static str, value: &mut T, default: T)
where
    T: Default + PartialEq + Debug,
{
    if *value == T::default() {
        let err = ConfigError::InvalidValue {
            key,
            message: "must be greater than zero".to_string(),
        };
        warn!(error = %err, fallback = ?default, "using default task setting");
        *value = default;
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
