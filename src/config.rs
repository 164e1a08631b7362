//! Service configuration, read from a TOML file.

use crate::errors::{Result, StatsError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delta flush ticker period in milliseconds
    pub flush_interval_ms: u64,

    /// Cache refresh ticker period in milliseconds
    pub refresh_interval_ms: u64,

    /// How far behind the last seen version a cache refresh rescans, in
    /// milliseconds. Covers transactions that commit after a newer version
    /// was already observed.
    pub refresh_lag_ms: u64,

    /// Attempts per store transaction before a conflict is surfaced
    pub retry_attempts: u32,

    /// First retry backoff in milliseconds, doubled on every attempt
    pub retry_base_ms: u64,

    /// Upper bound for a single retry backoff in milliseconds
    pub retry_max_backoff_ms: u64,

    /// Number of lock shards in the delta tracker
    pub delta_shards: usize,

    /// Buckets per histogram built by analyze
    pub histogram_buckets: usize,

    /// HTTP status port
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval_ms: 60_000,
            refresh_interval_ms: 3_000,
            refresh_lag_ms: 9_000,
            retry_attempts: 5,
            retry_base_ms: 10,
            retry_max_backoff_ms: 1_000,
            delta_shards: 16,
            histogram_buckets: 256,
            listen_port: 10080,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| StatsError::Config(format!("cannot parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_attempts == 0 {
            return Err(StatsError::Config("retry_attempts must be at least 1".to_string()));
        }
        if self.delta_shards == 0 {
            return Err(StatsError::Config("delta_shards must be at least 1".to_string()));
        }
        if self.histogram_buckets == 0 {
            return Err(StatsError::Config("histogram_buckets must be at least 1".to_string()));
        }
        if self.flush_interval_ms == 0 || self.refresh_interval_ms == 0 {
            return Err(StatsError::Config("ticker intervals must be positive".to_string()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn refresh_lag(&self) -> Duration {
        Duration::from_millis(self.refresh_lag_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base: Duration::from_millis(self.retry_base_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }
}

/// Bounded exponential backoff for store transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Config::default().retry_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml("flush_interval_ms = 500\nlisten_port = 8080\n").unwrap();
        assert_eq!(config.flush_interval(), Duration::from_millis(500));
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.retry_attempts, Config::default().retry_attempts);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            Config::from_toml("retry_attempts = 0"),
            Err(StatsError::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("flush_interval_ms = \"fast\""),
            Err(StatsError::Config(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            base: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }
}
