//! Configuration for the sync engine.

use pushsync_protocol::DeviceMetadata;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory instance id. Queue and state files are namespaced by it.
    pub instance_id: String,
    /// Retry policy for directory calls that retry.
    pub retry: RetryConfig,
    /// How long to wait for the token provider before giving up.
    pub token_provider_timeout: Duration,
    /// Metadata of the running application.
    pub metadata: DeviceMetadata,
}

impl EngineConfig {
    /// Creates a configuration for `instance_id` with default policies.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            retry: RetryConfig::default(),
            token_provider_timeout: Duration::from_secs(15),
            metadata: DeviceMetadata::default(),
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the token provider timeout.
    pub fn with_token_provider_timeout(mut self, timeout: Duration) -> Self {
        self.token_provider_timeout = timeout;
        self
    }

    /// Sets the application metadata.
    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Path of the job queue file for this instance inside `dir`.
    pub fn queue_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.jobqueue", self.instance_id))
    }

    /// Path of the device state file for this instance inside `dir`.
    pub fn state_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.device", self.instance_id))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
///
/// The delay before attempt `n` (1-based) is
/// `min(max_delay, initial_delay * backoff_multiplier^(n - 1))`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a configuration with the default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(32),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    ///
    /// Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(4)
    }
}
