//! Runtime configuration for the sync subsystem

use std::time::Duration;

use chrono::Duration as ChronoDuration;

/// Default backoff schedule, hours to wait keyed by attempt count
pub const DEFAULT_RETRY_DELAY_HOURS: &[i64] = &[1, 2, 6, 24, 72];

/// Retry gating policy derived from [`SyncSettings`].
///
/// Attempt counts are 1-based: a record that has failed once waits
/// `delays[0]` before it becomes selectable again. Attempts past the end of
/// the schedule reuse the last delay; attempts at or above `max_attempts`
/// are never selected again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<ChronoDuration>,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, delay_hours: &[i64]) -> Self {
        let hours = if delay_hours.is_empty() {
            DEFAULT_RETRY_DELAY_HOURS
        } else {
            delay_hours
        };

        Self {
            max_attempts: max_attempts.max(1),
            delays: hours.iter().copied().map(ChronoDuration::hours).collect(),
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn delays(&self) -> &[ChronoDuration] {
        &self.delays
    }

    /// Backoff delay after the given number of attempts
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> ChronoDuration {
        let index = (attempts.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }

    /// True once a record has used up its delivery attempts
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, DEFAULT_RETRY_DELAY_HOURS)
    }
}

/// Configuration surface for the offline sync subsystem.
///
/// Fields are public so call sites can use struct-update syntax over
/// `Default::default()`.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Base URL of the remote ingestion service
    pub api_base_url: String,
    /// Delivery attempts before a record is only surfaced via statistics
    pub max_sync_attempts: u32,
    /// Records selected per sync cycle
    pub sync_batch_size: usize,
    /// Backoff schedule, hours keyed by attempt count
    pub retry_delay_hours: Vec<i64>,
    /// Pause between auto-sync cycles
    pub daemon_interval: Duration,
    /// Pause after an unexpected scheduler error
    pub fallback_interval: Duration,
    /// Age past which synced records are eligible for purging
    pub retention_horizon_days: u32,
    /// Maximum simultaneous in-flight deliveries
    pub concurrency_ceiling: usize,
    /// Timeout applied to every delivery request
    pub request_timeout: Duration,
    /// Timeout applied to the reachability probe
    pub probe_timeout: Duration,
}

impl SyncSettings {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_sync_attempts, &self.retry_delay_hours)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5080".to_string(),
            max_sync_attempts: 5,
            sync_batch_size: 50,
            retry_delay_hours: DEFAULT_RETRY_DELAY_HOURS.to_vec(),
            daemon_interval: Duration::from_secs(15 * 60),
            fallback_interval: Duration::from_secs(60),
            retention_horizon_days: 30,
            concurrency_ceiling: 5,
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_documented_values() {
        let settings = SyncSettings::default();
        assert_eq!(settings.max_sync_attempts, 5);
        assert_eq!(settings.sync_batch_size, 50);
        assert_eq!(settings.retry_delay_hours, vec![1, 2, 6, 24, 72]);
        assert_eq!(settings.concurrency_ceiling, 5);
        assert_eq!(settings.retention_horizon_days, 30);
    }

    #[test]
    fn delay_for_follows_schedule_and_clamps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), ChronoDuration::hours(1));
        assert_eq!(policy.delay_for(3), ChronoDuration::hours(6));
        assert_eq!(policy.delay_for(5), ChronoDuration::hours(72));
        assert_eq!(policy.delay_for(9), ChronoDuration::hours(72));
    }

    #[test]
    fn exhaustion_is_keyed_by_max_attempts() {
        let policy = RetryPolicy::new(3, &[1, 2]);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn empty_schedule_falls_back_to_default() {
        let policy = RetryPolicy::new(5, &[]);
        assert_eq!(policy.delays().len(), DEFAULT_RETRY_DELAY_HOURS.len());
    }
}
