//! Config - 各コンポーネントの設定値
//!
//! どれも `Default` で実用的な値を持ち、`with_*` で部分的に上書きする。
//! 組み合わせとしての妥当性は `AppBuilder::build` が検証する。

use std::time::Duration;

use crate::domain::RetryPolicy;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A PENDING/PROCESSING record untouched for this long may be reclaimed.
    pub processing_timeout: Duration,

    /// How long a record (and therefore a replayable result) is kept.
    pub record_ttl: Duration,

    /// FAILED records a single submit may clear before reporting the failure.
    pub max_failure_retries: u32,

    /// Bounds for the `retry_after` hint of an in-flight outcome.
    pub min_retry_after: Duration,
    pub max_retry_after: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(30),
            record_ttl: Duration::from_secs(24 * 60 * 60),
            max_failure_retries: 1,
            min_retry_after: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(5),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    pub fn with_max_failure_retries(mut self, retries: u32) -> Self {
        self.max_failure_retries = retries;
        self
    }

    pub fn with_retry_after(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_after = min;
        self.max_retry_after = max;
        self
    }
}

/// Delivery settings for the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deliveries before a message is dead-lettered.
    pub max_delivery_attempts: u32,

    /// A leased message not acked within this window is redelivered.
    pub visibility_timeout: Duration,

    pub retry_policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            visibility_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,

    /// How long one `lease` call waits before the worker re-checks shutdown.
    pub lease_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_wait: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_lease_wait(mut self, wait: Duration) -> Self {
        self.lease_wait = wait;
        self
    }
}

/// Expiry reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,

    /// Max records examined per pass.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_results_a_day() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.record_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_failure_retries, 1);
        assert!(config.record_ttl > config.processing_timeout);
    }

    #[test]
    fn builders_override_single_fields() {
        let config = CoordinatorConfig::default()
            .with_processing_timeout(Duration::from_secs(5))
            .with_retry_after(Duration::from_millis(100), Duration::from_secs(2));

        assert_eq!(config.processing_timeout, Duration::from_secs(5));
        assert_eq!(config.min_retry_after, Duration::from_millis(100));
        assert_eq!(config.max_retry_after, Duration::from_secs(2));
        assert_eq!(config.record_ttl, CoordinatorConfig::default().record_ttl);
    }
}
