//! Layered runtime configuration: compiled-in defaults, optionally
//! overridden by a `queue.toml` file, optionally overridden again by
//! `QUEUE__`-prefixed environment variables. Loading itself (the `config`
//! crate plumbing) lives in `queue-cli`, which is the only place that knows
//! about file paths and environment; this module just defines the shape and
//! its defaults.

use serde::{Deserialize, Serialize};

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &std::time::Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<std::time::Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(std::time::Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    pub jobs: JobDefaults,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            jobs: JobDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max: usize,
    #[serde(with = "duration_secs")]
    pub poll_interval: std::time::Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max: 5,
            poll_interval: std::time::Duration::from_secs(1),
            shutdown_timeout: std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: std::time::Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: std::time::Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: std::time::Duration::from_secs(1),
            max_delay: std::time::Duration::from_secs(5 * 60),
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    #[serde(with = "duration_secs")]
    pub default_timeout: std::time::Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_completed_after: std::time::Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_failed_after: std::time::Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            default_timeout: std::time::Duration::from_secs(30 * 60),
            cleanup_completed_after: std::time::Duration::from_secs(7 * 24 * 3600),
            cleanup_failed_after: std::time::Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl QueueConfig {
    /// A preset tuned for local development: faster polling, fewer retries,
    /// so a broken job surfaces quickly instead of retrying for minutes.
    pub fn development() -> Self {
        let mut cfg = Self::default();
        cfg.workers.max = 2;
        cfg.workers.poll_interval = std::time::Duration::from_millis(250);
        cfg.retry.max_retries = 1;
        cfg.retry.max_delay = std::time::Duration::from_secs(10);
        cfg
    }

    /// A preset tuned for production: more workers, more retries, longer
    /// caps, matching the throughput/resilience tradeoffs a live deployment
    /// wants over a developer's inner loop.
    pub fn production() -> Self {
        let mut cfg = Self::default();
        cfg.workers.max = 20;
        cfg.retry.max_retries = 5;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.workers.max, 5);
        assert_eq!(cfg.workers.poll_interval.as_secs(), 1);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_delay.as_secs(), 1);
        assert_eq!(cfg.jobs.default_timeout.as_secs(), 1800);
    }

    #[test]
    fn production_preset_serializes() {
        let cfg = QueueConfig::production();
        let text = serde_json::to_string(&cfg).unwrap();
        assert!(text.contains("\"max\":20"));
    }
}
