//! DDL runtime configuration.
//!
//! Defaults suit a small cluster; every knob can be overridden from the
//! environment with [`DdlConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Schema lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long a node may use a loaded schema without refreshing.
    pub ttl_ms: u64,
    /// How often nodes reload the schema and renew their lease.
    pub refresh_interval_ms: u64,
    /// How often the owner re-reads node leases while waiting.
    pub convergence_poll_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 2_000,
            refresh_interval_ms: 500,
            convergence_poll_ms: 20,
        }
    }
}

impl LeaseConfig {
    /// Lease TTL as a duration.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Refresh interval as a duration.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Convergence poll interval as a duration.
    #[must_use]
    pub const fn convergence_poll(&self) -> Duration {
        Duration::from_millis(self.convergence_poll_ms)
    }
}

/// Owner election and scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    /// Owner lease duration; a peer takes over at most this long after a crash.
    pub lease_ms: u64,
    /// Interval between queue polls and lease renewals.
    pub poll_interval_ms: u64,
    /// Jobs (one per table) driven concurrently.
    pub max_concurrent_jobs: usize,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            lease_ms: 3_000,
            poll_interval_ms: 50,
            max_concurrent_jobs: 8,
        }
    }
}

impl OwnerConfig {
    /// Owner lease as a duration.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Backfill settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorgConfig {
    /// Parallel workers per reorganization.
    pub workers: usize,
    /// Rows per committed chunk.
    pub batch_size: usize,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 256,
        }
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive transient failures tolerated per job step.
    pub max_attempts: u32,
    /// First backoff delay.
    pub base_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_ms: 20,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given attempt (1-based), capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1_u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration of the DDL subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdlConfig {
    /// Schema lease settings.
    pub lease: LeaseConfig,
    /// Owner settings.
    pub owner: OwnerConfig,
    /// Backfill settings.
    pub reorg: ReorgConfig,
    /// Retry settings.
    pub retry: RetryConfig,
}

impl DdlConfig {
    /// Loads configuration from environment variables over the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `KEEL_SCHEMA_LEASE_MS`, `KEEL_SCHEMA_REFRESH_MS`, `KEEL_CONVERGENCE_POLL_MS`
    /// - `KEEL_OWNER_LEASE_MS`, `KEEL_OWNER_POLL_MS`, `KEEL_MAX_CONCURRENT_JOBS`
    /// - `KEEL_REORG_WORKERS`, `KEEL_REORG_BATCH_SIZE`
    /// - `KEEL_DDL_RETRY_ATTEMPTS`
    /// - `KEEL_DDL_BACKOFF_MS`: `base` or `base,max`
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparsable, or if the
    /// result fails [`DdlConfig::validate`].
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_u64("KEEL_SCHEMA_LEASE_MS")? {
            config.lease.ttl_ms = v;
        }
        if let Some(v) = env_u64("KEEL_SCHEMA_REFRESH_MS")? {
            config.lease.refresh_interval_ms = v;
        }
        if let Some(v) = env_u64("KEEL_CONVERGENCE_POLL_MS")? {
            config.lease.convergence_poll_ms = v;
        }
        if let Some(v) = env_u64("KEEL_OWNER_LEASE_MS")? {
            config.owner.lease_ms = v;
        }
        if let Some(v) = env_u64("KEEL_OWNER_POLL_MS")? {
            config.owner.poll_interval_ms = v;
        }
        if let Some(v) = env_usize("KEEL_MAX_CONCURRENT_JOBS")? {
            config.owner.max_concurrent_jobs = v;
        }
        if let Some(v) = env_usize("KEEL_REORG_WORKERS")? {
            config.reorg.workers = v;
        }
        if let Some(v) = env_usize("KEEL_REORG_BATCH_SIZE")? {
            config.reorg.batch_size = v;
        }
        if let Some(v) = env_string("KEEL_DDL_RETRY_ATTEMPTS") {
            config.retry.max_attempts = v.parse().map_err(|e| {
                Error::Config(format!("KEEL_DDL_RETRY_ATTEMPTS must be a u32: {e}"))
            })?;
        }
        if let Some(v) = env_string("KEEL_DDL_BACKOFF_MS") {
            let (base, max) = parse_backoff("KEEL_DDL_BACKOFF_MS", &v)?;
            config.retry.base_backoff_ms = base;
            if let Some(max) = max {
                config.retry.max_backoff_ms = max;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.lease.ttl_ms == 0 {
            return Err(Error::Config("schema lease TTL must be positive".into()));
        }
        if self.lease.refresh_interval_ms == 0
            || self.lease.refresh_interval_ms >= self.lease.ttl_ms
        {
            return Err(Error::Config(format!(
                "schema refresh interval ({}ms) must be positive and shorter than the lease TTL ({}ms)",
                self.lease.refresh_interval_ms, self.lease.ttl_ms
            )));
        }
        if self.lease.convergence_poll_ms == 0 || self.owner.poll_interval_ms == 0 {
            return Err(Error::Config("poll intervals must be positive".into()));
        }
        if self.owner.lease_ms <= self.owner.poll_interval_ms {
            return Err(Error::Config(
                "owner lease must be longer than the owner poll interval".into(),
            ));
        }
        if self.owner.max_concurrent_jobs == 0 {
            return Err(Error::Config("max_concurrent_jobs must be positive".into()));
        }
        if self.reorg.workers == 0 || self.reorg.batch_size == 0 {
            return Err(Error::Config(
                "reorg workers and batch size must be positive".into(),
            ));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config(
                "base backoff must not exceed max backoff".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} must be a usize: {e}")))
}

fn parse_backoff(name: &str, value: &str) -> Result<(u64, Option<u64>)> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|e| Error::Config(format!("{name} must be `base` or `base,max`: {e}")))
    };
    match value.split_once(',') {
        Some((base, max)) => Ok((parse(base)?, Some(parse(max)?))),
        None => Ok((parse(value)?, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        DdlConfig::default().validate()
    }

    #[test]
    fn refresh_must_be_shorter_than_ttl() {
        let mut config = DdlConfig::default();
        config.lease.refresh_interval_ms = config.lease.ttl_ms;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_workers_are_rejected() {
        let mut config = DdlConfig::default();
        config.reorg.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(20));
        assert_eq!(retry.backoff(2), Duration::from_millis(40));
        assert_eq!(retry.backoff(30), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_env_accepts_optional_max() -> Result<()> {
        assert_eq!(parse_backoff("X", "15")?, (15, None));
        assert_eq!(parse_backoff("X", "15, 300")?, (15, Some(300)));
        assert!(parse_backoff("X", "fast").is_err());
        Ok(())
    }

    #[test]
    fn partial_json_fills_defaults() -> serde_json::Result<()> {
        let config: DdlConfig = serde_json::from_str(r#"{"reorg":{"workers":2}}"#)?;
        assert_eq!(config.reorg.workers, 2);
        assert_eq!(config.reorg.batch_size, 256);
        assert_eq!(config.lease, LeaseConfig::default());
        Ok(())
    }
}
