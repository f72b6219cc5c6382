//! Configuration for the sync engine.

use crate::endpoint::EndpointKey;
use crate::error::{SyncError, SyncResult};
use std::time::Duration;
use vitalsync_protocol::DataTypeId;

/// Configuration for sync operations.
///
/// A configuration is immutable once handed to the engine. Replacing it
/// (see [`crate::SyncService::initialize`]) cancels any session running
/// under the previous one.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upload endpoint URL.
    pub endpoint: String,
    /// Bearer token sent with every upload.
    pub token: String,
    /// Tracked data types, in collection order, without duplicates.
    pub tracked_types: Vec<DataTypeId>,
    /// Maximum number of records the batcher places in one internal chunk.
    pub chunk_size: usize,
    /// Maximum number of records in one upload request.
    pub records_per_chunk: usize,
    /// Retry configuration for transient upload failures.
    pub retry: RetryConfig,
    /// Window in which observer notifications for one type are merged.
    pub debounce: Duration,
    /// Interval of the periodic catch-up task.
    pub periodic_interval: Duration,
    /// Request timeout passed to the uploader.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration with no tracked types.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            tracked_types: Vec::new(),
            chunk_size: 1000,
            records_per_chunk: 500,
            retry: RetryConfig::default(),
            debounce: Duration::from_secs(2),
            periodic_interval: Duration::from_secs(15 * 60),
            timeout: Duration::from_secs(30),
        }
    }

    /// Adds a tracked type. Duplicates are ignored.
    pub fn with_type(mut self, type_id: impl Into<DataTypeId>) -> Self {
        let type_id = type_id.into();
        if !self.tracked_types.contains(&type_id) {
            self.tracked_types.push(type_id);
        }
        self
    }

    /// Adds several tracked types. Duplicates are ignored.
    pub fn with_types<I, T>(self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DataTypeId>,
    {
        types.into_iter().fold(self, |config, t| config.with_type(t))
    }

    /// Sets the internal chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Sets the maximum number of records per upload request.
    pub fn with_records_per_chunk(mut self, size: usize) -> Self {
        self.records_per_chunk = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the observer debounce window.
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    /// Sets the periodic catch-up interval.
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the key isolating this endpoint's anchors and sessions.
    pub fn endpoint_key(&self) -> EndpointKey {
        EndpointKey::from_url(&self.endpoint)
    }

    /// Number of records actually placed in one upload batch.
    pub fn batch_capacity(&self) -> usize {
        self.records_per_chunk.min(self.chunk_size).max(1)
    }

    /// Checks that background sync can run with this configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(SyncError::Configuration("endpoint is not set".into()));
        }
        if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
            return Err(SyncError::Configuration(format!(
                "endpoint {endpoint} is not an http(s) URL"
            )));
        }
        if self.token.trim().is_empty() {
            return Err(SyncError::Configuration("bearer token is not set".into()));
        }
        if self.tracked_types.is_empty() {
            return Err(SyncError::Configuration("no data types are tracked".into()));
        }
        if self.chunk_size == 0 || self.records_per_chunk == 0 {
            return Err(SyncError::Configuration(
                "chunk sizes must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(SyncError::Configuration(format!(
                "retry.backoff_multiplier must be a finite number >= 1, got {multiplier}"
            )));
        }
        Ok(())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per batch, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = if base_delay.is_finite() && base_delay >= 0.0 {
            base_delay.min(max_secs)
        } else {
            max_secs
        };

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Cheap jitter source derived from the clock's sub-second nanos.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SyncConfig {
        SyncConfig::new("https://ingest.example.com/v1/samples", "secret")
            .with_types(["steps", "heart_rate"])
    }

    #[test]
    fn sync_config_builder() {
        let config = valid()
            .with_type("steps")
            .with_chunk_size(200)
            .with_records_per_chunk(50)
            .with_timeout(Duration::from_secs(60));

        assert_eq!(config.tracked_types.len(), 2);
        assert_eq!(config.chunk_size, 200);
        assert_eq!(config.records_per_chunk, 50);
        assert_eq!(config.batch_capacity(), 50);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn batch_capacity_uses_smaller_limit() {
        let config = valid().with_chunk_size(10).with_records_per_chunk(500);
        assert_eq!(config.batch_capacity(), 10);
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let cases = [
            SyncConfig::new("", "secret").with_type("steps"),
            SyncConfig::new("ftp://example.com", "secret").with_type("steps"),
            SyncConfig::new("https://example.com", "  ").with_type("steps"),
            SyncConfig::new("https://example.com", "secret"),
            valid().with_records_per_chunk(0),
            valid().with_retry(RetryConfig::new(0)),
            valid().with_retry(RetryConfig::new(3).with_backoff_multiplier(-2.0)),
            valid().with_retry(RetryConfig::new(3).with_backoff_multiplier(0.5)),
            valid().with_retry(RetryConfig::new(3).with_backoff_multiplier(f64::NAN)),
            valid().with_retry(RetryConfig::new(3).with_backoff_multiplier(f64::INFINITY)),
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(SyncError::Configuration(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn malformed_multiplier_never_yields_a_negative_delay() {
        let config = RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_backoff_multiplier(-3.0)
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));

        let config = config.with_backoff_multiplier(f64::NAN);
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(2));
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(150));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(250))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(1));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
    }
}
