use std::collections::HashMap;
use std::time::Duration;

use catscan_model::DriverType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Global knobs that tune the scan engine.
///
/// All fields carry defaults so deployments only need to supply the values
/// they want to change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempt ceiling and backoff policy for leaf work.
    pub retry: LeafRetryConfig,
    /// Pacing of the index scan self-requeue loop.
    pub poll: PollConfig,
    /// Start-lease TTL and renewal cadence.
    pub lease: LeaseConfig,
    /// Worker pool sizing and delivery settings.
    pub queue: QueueConfig,
    /// Catalog feed location and HTTP client settings.
    pub catalog: CatalogConfig,
    /// Drivers that must not be started, even when requested explicitly.
    pub disabled_drivers: Vec<DriverType>,
    /// Operator-pinned external cursor values, keyed by source name.
    pub pinned_sources: HashMap<String, DateTime<Utc>>,
    /// How many of the most recent scans `status` reports per cursor.
    pub latest_scan_lookup_limit: usize,
    /// Completed or aborted scans kept per cursor, besides the current one.
    pub old_index_scans_to_keep: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: LeafRetryConfig::default(),
            poll: PollConfig::default(),
            lease: LeaseConfig::default(),
            queue: QueueConfig::default(),
            catalog: CatalogConfig::default(),
            disabled_drivers: Vec::new(),
            pinned_sources: HashMap::new(),
            latest_scan_lookup_limit: 5,
            old_index_scans_to_keep: 49,
        }
    }
}

impl EngineConfig {
    pub fn is_disabled(&self, driver: &DriverType) -> bool {
        self.disabled_drivers.contains(driver)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafRetryConfig {
    /// Attempts beyond this move the leaf message to the poison queue.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Redelivery delay after a driver asks to try again later.
    pub try_again_later_ms: u64,
    /// Longest a message waits in one hop for a leaf's not-before time.
    pub not_before_cap_ms: u64,
}

impl LeafRetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn try_again_later(&self) -> Duration {
        Duration::from_millis(self.try_again_later_ms)
    }

    pub fn not_before_cap(&self) -> Duration {
        Duration::from_millis(self.not_before_cap_ms)
    }
}

impl Default for LeafRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base_ms: 60_000,
            backoff_max_ms: 30 * 60 * 1_000,
            jitter_ratio: 0.25,
            try_again_later_ms: 60_000,
            not_before_cap_ms: 10 * 60 * 1_000,
        }
    }
}

/// Delay before an index scan re-examines its children:
/// `min(attempt * step, max)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub step_ms: u64,
    pub max_ms: u64,
}

impl PollConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self.step_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(ms.min(self.max_ms))
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            step_ms: 1_000,
            max_ms: 60_000,
        }
    }
}

/// Lease/heartbeat tuning for the start lease.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// TTL for a freshly acquired lease (seconds)
    pub lease_ttl_secs: i64,
    /// Renew once this fraction of the TTL has elapsed (e.g. 0.5)
    pub renew_at_fraction: f32,
}

impl LeaseConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs.max(1))
    }

    pub fn renew_interval(&self) -> Duration {
        let fraction = f64::from(self.renew_at_fraction.clamp(0.1, 0.9));
        let secs = (self.lease_ttl_secs.max(1) as f64) * fraction;
        Duration::from_millis((secs * 1_000.0) as u64)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 60,
            renew_at_fraction: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker loops per process.
    pub worker_count: usize,
    /// Deliveries pulled per receive.
    pub batch_size: usize,
    /// How long a received message stays invisible to other workers.
    pub visibility_timeout_ms: u64,
    /// Index and page messages delivered more often than this are poisoned.
    pub max_dequeue_count: u32,
    /// Sleep between receives when the queue is empty.
    pub idle_poll_ms: u64,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 32,
            visibility_timeout_ms: 5 * 60 * 1_000,
            max_dequeue_count: 16,
            idle_poll_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub index_url: String,
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl CatalogConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            index_url: "https://api.nuget.org/v3/catalog0/index.json".to_string(),
            request_timeout_ms: 100_000,
            user_agent: format!("catscan/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_delay_grows_linearly_then_caps() {
        let poll = PollConfig::default();
        assert_eq!(poll.delay(0), Duration::ZERO);
        assert_eq!(poll.delay(3), Duration::from_secs(3));
        assert_eq!(poll.delay(500), Duration::from_secs(60));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"retry":{"max_attempts":3}}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.try_again_later_ms, 60_000);
        assert_eq!(config.queue.batch_size, 32);
    }

    #[test]
    fn renew_interval_is_fraction_of_ttl() {
        let lease = LeaseConfig::default();
        assert_eq!(lease.renew_interval(), Duration::from_secs(30));
    }
}
