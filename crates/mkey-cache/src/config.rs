//! Cache configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest size class cached by default.
pub const DEFAULT_MIN_ORDER: u8 = 2;

/// Number of size classes cached by default.
pub const DEFAULT_NUM_ORDERS: usize = 16;

/// Upper bound on concurrent in-flight creations per entry.
pub const DEFAULT_MAX_PENDING: u32 = 8;

/// Default quiet window before excess idle keys are trimmed.
pub const DEFAULT_RELEASE_TIMEOUT_SECS: i64 = 300;

/// Hard cap on the release timeout and on any delayed trim reschedule.
pub const MAX_RELEASE_TIMEOUT_SECS: i64 = 600;

/// Largest accepted per-order limit; the doubled high-water mark must
/// stay within `u32`.
pub const MAX_LIMIT: u32 = u32::MAX / 2;

/// Retry delay when the pending window or command queue is saturated.
pub const DEFAULT_BUSY_RETRY: Duration = Duration::from_millis(3);

/// Retry delay after a non-busy creation failure.
pub const DEFAULT_FAILURE_RETRY: Duration = Duration::from_secs(1);

/// How long fills stay suppressed after a creation failure.
pub const DEFAULT_FILL_COOLDOWN: Duration = Duration::from_secs(1);

/// Total time budget for an administrative grow.
pub const DEFAULT_GROW_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while draining in-flight creations at teardown.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Poll rounds before teardown abandons in-flight creations.
pub const DEFAULT_DRAIN_ROUNDS: u32 = 1000;

/// Default low-water marks per size class, largest classes last.
const DEFAULT_LIMIT_PROFILE: [u32; DEFAULT_NUM_ORDERS] =
    [128, 128, 64, 64, 32, 32, 16, 16, 8, 8, 4, 4, 2, 2, 1, 1];

/// Configuration for a [`KeyCache`](crate::cache::KeyCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Smallest cached order; requests below it are clamped up to it.
    pub min_order: u8,
    /// Low-water mark per order, index 0 = `min_order`. A limit of 0
    /// disables background filling for that order.
    pub limits: Vec<u32>,
    /// Upper bound on concurrent in-flight creations per entry.
    pub max_pending: u32,
    /// Seconds of quiet required before trimming; -1 disables
    /// automatic trimming entirely.
    pub release_timeout_secs: i64,
    /// Fill retry delay when the pending window is saturated.
    pub busy_retry: Duration,
    /// Fill retry delay after a creation failure.
    pub failure_retry: Duration,
    /// How long fills stay suppressed after a creation failure.
    pub fill_cooldown: Duration,
    /// Total time budget for administrative grows.
    pub grow_timeout: Duration,
    /// Poll interval of the teardown drain loop.
    pub drain_interval: Duration,
    /// Maximum teardown drain polls before giving up.
    pub drain_rounds: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_order: DEFAULT_MIN_ORDER,
            limits: DEFAULT_LIMIT_PROFILE.to_vec(),
            max_pending: DEFAULT_MAX_PENDING,
            release_timeout_secs: DEFAULT_RELEASE_TIMEOUT_SECS, // 5 minutes
            busy_retry: DEFAULT_BUSY_RETRY,                     // 3 ms
            failure_retry: DEFAULT_FAILURE_RETRY,               // 1 s
            fill_cooldown: DEFAULT_FILL_COOLDOWN,               // 1 s
            grow_timeout: DEFAULT_GROW_TIMEOUT,                 // 30 s
            drain_interval: DEFAULT_DRAIN_INTERVAL,             // 50 ms
            drain_rounds: DEFAULT_DRAIN_ROUNDS,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the default size-class profile.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the smallest cached order.
    pub fn with_min_order(mut self, min_order: u8) -> Self {
        self.min_order = min_order;
        self
    }

    /// Replaces the per-order low-water marks (one per cached order).
    pub fn with_limits(mut self, limits: Vec<u32>) -> Self {
        self.limits = limits;
        self
    }

    /// Uses the same low-water mark for `orders` consecutive classes.
    pub fn with_uniform_limit(mut self, limit: u32, orders: usize) -> Self {
        self.limits = vec![limit; orders];
        self
    }

    /// Sets the in-flight creation bound per entry.
    pub fn with_max_pending(mut self, max_pending: u32) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Sets the trim quiet window in seconds (-1 disables trimming).
    pub fn with_release_timeout(mut self, secs: i64) -> Self {
        self.release_timeout_secs = secs;
        self
    }

    /// Sets the saturated-fill retry delay.
    pub fn with_busy_retry(mut self, delay: Duration) -> Self {
        self.busy_retry = delay;
        self
    }

    /// Sets the failed-fill retry delay.
    pub fn with_failure_retry(mut self, delay: Duration) -> Self {
        self.failure_retry = delay;
        self
    }

    /// Sets the post-failure fill suppression interval.
    pub fn with_fill_cooldown(mut self, cooldown: Duration) -> Self {
        self.fill_cooldown = cooldown;
        self
    }

    /// Sets the administrative grow time budget.
    pub fn with_grow_timeout(mut self, timeout: Duration) -> Self {
        self.grow_timeout = timeout;
        self
    }

    /// Sets the teardown drain pacing.
    pub fn with_drain(mut self, interval: Duration, rounds: u32) -> Self {
        self.drain_interval = interval;
        self.drain_rounds = rounds;
        self
    }

    /// Number of cached orders.
    pub fn num_orders(&self) -> usize {
        self.limits.len()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.limits.is_empty() {
            return Err("At least one cached order is required".to_string());
        }
        if usize::from(self.min_order) + self.limits.len() > usize::from(u8::MAX) + 1 {
            return Err(format!(
                "Orders {}..{}+{} overflow the order range",
                self.min_order,
                self.min_order,
                self.limits.len()
            ));
        }
        if let Some(&limit) = self.limits.iter().find(|&&limit| limit > MAX_LIMIT) {
            return Err(format!("Limit {limit} is above the maximum {MAX_LIMIT}"));
        }
        if self.max_pending == 0 {
            return Err("max_pending must be at least 1".to_string());
        }
        if self.release_timeout_secs < -1 || self.release_timeout_secs > MAX_RELEASE_TIMEOUT_SECS {
            return Err(format!(
                "release_timeout_secs {} outside -1..={MAX_RELEASE_TIMEOUT_SECS}",
                self.release_timeout_secs
            ));
        }
        if self.fill_cooldown.is_zero() {
            return Err("fill_cooldown must be non-zero".to_string());
        }
        if self.grow_timeout.is_zero() {
            return Err("grow_timeout must be non-zero".to_string());
        }
        if self.drain_rounds == 0 {
            return Err("drain_rounds must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_order, DEFAULT_MIN_ORDER);
        assert_eq!(config.num_orders(), DEFAULT_NUM_ORDERS);
        assert_eq!(config.max_pending, 8);
        assert_eq!(config.release_timeout_secs, 300);
    }

    #[test]
    fn default_profile_shrinks_with_order() {
        let config = CacheConfig::default();
        for pair in config.limits.windows(2) {
            assert!(pair[0] >= pair[1], "Limits should not grow with order");
        }
    }

    #[test]
    fn builder_methods_apply() {
        let config = CacheConfig::new()
            .with_min_order(4)
            .with_uniform_limit(8, 3)
            .with_max_pending(2)
            .with_release_timeout(0)
            .with_busy_retry(Duration::from_millis(1))
            .with_failure_retry(Duration::from_millis(100))
            .with_fill_cooldown(Duration::from_millis(200))
            .with_grow_timeout(Duration::from_secs(5))
            .with_drain(Duration::from_millis(10), 50);

        assert!(config.validate().is_ok());
        assert_eq!(config.min_order, 4);
        assert_eq!(config.limits, vec![8, 8, 8]);
        assert_eq!(config.max_pending, 2);
        assert_eq!(config.release_timeout_secs, 0);
        assert_eq!(config.drain_rounds, 50);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(CacheConfig::new().with_limits(Vec::new()).validate().is_err());
        assert!(CacheConfig::new().with_max_pending(0).validate().is_err());
        assert!(CacheConfig::new().with_release_timeout(-2).validate().is_err());
        assert!(
            CacheConfig::new()
                .with_release_timeout(MAX_RELEASE_TIMEOUT_SECS + 1)
                .validate()
                .is_err()
        );
        assert!(
            CacheConfig::new()
                .with_fill_cooldown(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            CacheConfig::new()
                .with_min_order(250)
                .with_uniform_limit(1, 10)
                .validate()
                .is_err()
        );
        assert!(CacheConfig::new().with_drain(Duration::ZERO, 0).validate().is_err());
        assert!(CacheConfig::new().with_uniform_limit(MAX_LIMIT, 1).validate().is_ok());
        assert!(
            CacheConfig::new()
                .with_uniform_limit(MAX_LIMIT + 1, 1)
                .validate()
                .is_err()
        );
    }
}
