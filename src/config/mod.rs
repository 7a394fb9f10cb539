use crate::constants;
use crate::{Result, VesselError};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;


/// Top-level configuration, loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub batch: BatchSettings,
    pub queue: QueueSettings,
}

/// Scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Ceiling on simultaneously Running batches.
    pub max_batches: usize,
    pub poll_interval_ms: u64,
    pub progress_interval_ms: u64,
    pub recovery_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub default_concurrency: usize,
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,
}

/// Queue backend selection and tuning. A missing `redis_url` selects
/// process-local dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub claim_timeout_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batches: constants::DEFAULT_MAX_BATCHES,
            poll_interval_ms: constants::DEFAULT_POLL_INTERVAL_MS,
            progress_interval_ms: constants::DEFAULT_PROGRESS_INTERVAL_MS,
            recovery_interval_secs: constants::DEFAULT_RECOVERY_INTERVAL_SECS,
            settle_delay_secs: constants::DEFAULT_SETTLE_DELAY_SECS,
            default_concurrency: constants::DEFAULT_CONCURRENCY,
            default_timeout_secs: constants::DEFAULT_TASK_TIMEOUT_SECS,
            default_max_retries: constants::DEFAULT_MAX_RETRIES,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: constants::QUEUE_KEY_PREFIX.to_string(),
            claim_timeout_secs: constants::DEFAULT_CLAIM_TIMEOUT_SECS,
        }
    }
}

impl QueueSettings {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

impl Config {
    /// Loads configuration from the process environment, reading a `.env`
    /// file first when present.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found"),
        }
        Self::load_from(|key| env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup. `load()`
    /// wires this to the process environment; tests supply maps.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = BatchSettings::default();
        let batch = BatchSettings {
            max_batches: parse_or(&lookup, "VESSEL_MAX_BATCHES", defaults.max_batches),
            poll_interval_ms: parse_or(&lookup, "VESSEL_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            progress_interval_ms: parse_or(
                &lookup,
                "VESSEL_PROGRESS_INTERVAL_MS",
                defaults.progress_interval_ms,
            ),
            recovery_interval_secs: parse_or(
                &lookup,
                "VESSEL_RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval_secs,
            ),
            settle_delay_secs: parse_or(
                &lookup,
                "VESSEL_SETTLE_DELAY_SECS",
                defaults.settle_delay_secs,
            ),
            default_concurrency: parse_or(
                &lookup,
                "VESSEL_DEFAULT_CONCURRENCY",
                defaults.default_concurrency,
            ),
            default_timeout_secs: parse_or(
                &lookup,
                "VESSEL_DEFAULT_TIMEOUT_SECS",
                defaults.default_timeout_secs,
            ),
            default_max_retries: parse_or(
                &lookup,
                "VESSEL_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            ),
        };

        let queue_defaults = QueueSettings::default();
        let queue = QueueSettings {
            redis_url: lookup("REDIS_URL").filter(|s| !s.trim().is_empty()),
            key_prefix: lookup("VESSEL_QUEUE_PREFIX").unwrap_or(queue_defaults.key_prefix),
            claim_timeout_secs: parse_or(
                &lookup,
                "VESSEL_CLAIM_TIMEOUT_SECS",
                queue_defaults.claim_timeout_secs,
            ),
        };

        let config = Config { batch, queue };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batch.max_batches == 0 {
            return Err(VesselError::Configuration(
                "VESSEL_MAX_BATCHES must be at least 1".to_string(),
            ));
        }
        if self.batch.default_concurrency == 0 {
            return Err(VesselError::Configuration(
                "VESSEL_DEFAULT_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.batch.poll_interval_ms == 0 {
            return Err(VesselError::Configuration(
                "VESSEL_POLL_INTERVAL_MS must be non-zero".to_string(),
            ));
        }
        if let Some(url) = &self.queue.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(VesselError::Configuration(format!(
                    "REDIS_URL must use the redis:// or rediss:// scheme, got: {url}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
