//! Pool configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{PoolError, Result};

/// Default number of concurrently running children.
pub const DEFAULT_WORKERS: usize = 4;

/// Default number of extra reap passes allowed for a report to show up.
pub const DEFAULT_RECEIVE_RETRIES: u32 = 4;

/// Default size of one kernel message; matches the stock Linux `MSGMAX`.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8192;

/// Default sleep between scheduler polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Largest value a SysV semaphore can hold (`SEMVMX`).
pub const MAX_WORKERS: usize = 32767;

/// Smallest message size that still carries a frame flag plus payload.
pub const MIN_MESSAGE_SIZE: usize = 2;

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of live children.
    pub workers: usize,
    /// Timeout applied to units that do not declare their own.
    pub timeout: Option<Duration>,
    /// Existing file the IPC keys are derived from.
    pub key_seed: PathBuf,
    /// Reap passes to wait for a terminated child's report before giving up.
    pub receive_retries: u32,
    /// Bytes per kernel message; larger reports are split into frames.
    pub max_message_size: usize,
    /// Sleep between admission and reap polls.
    pub poll_interval: Duration,
    /// Deflate report envelopes when that shrinks them.
    pub compress: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            timeout: None,
            key_seed: default_key_seed(),
            receive_retries: DEFAULT_RECEIVE_RETRIES,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            compress: true,
        }
    }
}

/// The running executable, so re-running the same binary reuses the same keys.
fn default_key_seed() -> PathBuf {
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/"))
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_key_seed(mut self, seed: impl Into<PathBuf>) -> Self {
        self.key_seed = seed.into();
        self
    }

    pub fn with_receive_retries(mut self, retries: u32) -> Self {
        self.receive_retries = retries;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    /// Apply `FORKPOOL_*` environment overrides.
    ///
    /// Reads `FORKPOOL_WORKERS`, `FORKPOOL_TIMEOUT` (seconds, fractional
    /// allowed), `FORKPOOL_KEY_SEED`, `FORKPOOL_RECEIVE_RETRIES`,
    /// `FORKPOOL_MAX_MESSAGE_SIZE` and `FORKPOOL_POLL_INTERVAL_MS`. Values
    /// that do not parse are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(workers) = env_override("FORKPOOL_WORKERS") {
            self.workers = workers;
        }
        if let Some(secs) = env_override::<f64>("FORKPOOL_TIMEOUT") {
            match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => self.timeout = Some(timeout),
                Err(_) => warn!(
                    variable = "FORKPOOL_TIMEOUT",
                    value = secs,
                    "Ignoring out-of-range timeout"
                ),
            }
        }
        if let Ok(seed) = std::env::var("FORKPOOL_KEY_SEED") {
            self.key_seed = PathBuf::from(seed);
        }
        if let Some(retries) = env_override("FORKPOOL_RECEIVE_RETRIES") {
            self.receive_retries = retries;
        }
        if let Some(size) = env_override("FORKPOOL_MAX_MESSAGE_SIZE") {
            self.max_message_size = size;
        }
        if let Some(ms) = env_override("FORKPOOL_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(ms);
        }
        self
    }

    /// Check the configuration before any kernel resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.workers > MAX_WORKERS {
            return Err(PoolError::InvalidConfig(format!(
                "workers must be at most {} (semaphore limit), got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(PoolError::InvalidConfig(format!(
                "max_message_size must be at least {} bytes, got {}",
                MIN_MESSAGE_SIZE, self.max_message_size
            )));
        }
        if !self.key_seed.exists() {
            return Err(PoolError::InvalidConfig(format!(
                "key seed {} does not exist",
                self.key_seed.display()
            )));
        }
        Ok(())
    }
}

fn env_override<T: FromStr>(variable: &str) -> Option<T> {
    let raw = std::env::var(variable).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable, value = %raw, "Ignoring invalid environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.timeout, None);
        assert_eq!(config.receive_retries, 4);
        assert_eq!(config.max_message_size, 8192);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert!(config.compress);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new()
            .with_workers(2)
            .with_timeout(Duration::from_secs(3))
            .with_key_seed("/tmp")
            .with_compression(false);
        assert_eq!(config.workers, 2);
        assert_eq!(config.timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.key_seed, PathBuf::from("/tmp"));
        assert!(!config.compress);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PoolConfig::new().with_workers(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .with_workers(MAX_WORKERS + 1)
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new()
                .with_max_message_size(1)
                .validate()
                .is_err()
        );

        let err = PoolConfig::new()
            .with_key_seed("/definitely/not/here")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here"));
    }

    // All env handling in one test: the variables are process-global.
    #[test]
    fn test_env_overrides() {
        // SAFETY: no other test reads or writes FORKPOOL_* variables.
        unsafe {
            std::env::set_var("FORKPOOL_WORKERS", "7");
            std::env::set_var("FORKPOOL_TIMEOUT", "1.5");
            std::env::set_var("FORKPOOL_RECEIVE_RETRIES", "not-a-number");
            std::env::set_var("FORKPOOL_POLL_INTERVAL_MS", "25");
        }

        let config = PoolConfig::new().with_env_overrides();
        assert_eq!(config.workers, 7);
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.receive_retries, DEFAULT_RECEIVE_RETRIES);
        assert_eq!(config.poll_interval, Duration::from_millis(25));

        unsafe {
            std::env::remove_var("FORKPOOL_WORKERS");
            std::env::remove_var("FORKPOOL_TIMEOUT");
            std::env::remove_var("FORKPOOL_RECEIVE_RETRIES");
            std::env::remove_var("FORKPOOL_POLL_INTERVAL_MS");
        }
    }
}
