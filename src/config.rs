use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const MEG: u64 = 1024 * 1024;
const GIG: u64 = 1024 * MEG;

/// Size of every part but the last, as declared when initiating an upload.
///
/// The service accepts powers of two from 1 MiB up to 4 GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartSize(u64);

impl PartSize {
    pub const MIN: PartSize = PartSize(MEG);
    pub const MAX: PartSize = PartSize(4 * GIG);

    pub fn new(bytes: u64) -> Result<Self, ConfigError> {
        if bytes < Self::MIN.0 || bytes > Self::MAX.0 {
            return Err(ConfigError::PartSizeOutOfRange {
                size: bytes,
                min: Self::MIN.0,
                max: Self::MAX.0,
            });
        }
        if !bytes.is_power_of_two() {
            return Err(ConfigError::PartSizeNotPowerOfTwo(bytes));
        }
        Ok(Self(bytes))
    }

    pub fn from_mib(mib: u64) -> Result<Self, ConfigError> {
        Self::new(mib.saturating_mul(MEG))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Default for PartSize {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Display for PartSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PartSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPartSize(s.into()))?;
        Self::new(bytes)
    }
}

/// Exponential backoff for retryable service errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        // overflowing or non-finite delays saturate at the cap
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub part_size: PartSize,
    /// Number of parts in flight at once; `1` uploads strictly in order.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: PartSize::default(),
            concurrency: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl UploadConfig {
    pub fn builder() -> UploadConfigBuilder {
        UploadConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}

pub struct UploadConfigBuilder {
    config: UploadConfig,
}

impl UploadConfigBuilder {
    pub fn part_size(mut self, part_size: PartSize) -> Self {
        self.config.part_size = part_size;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    pub fn build(self) -> Result<UploadConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
