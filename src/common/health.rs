//! Health derivation for slots and consumers
//!
//! Units report counters into a [`HealthTracker`]; the supervisor and the
//! status interface read assessed [`Health`] snapshots out. Consumers are
//! additionally judged on how far their cursor lags the log head.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Assessed health of a slot or consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum Health {
    /// Operating normally
    Healthy,
    /// Operating but degraded (recent failures or growing lag)
    Degraded(String),
    /// Not making progress
    Unhealthy(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

/// Thresholds for health assessment.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures before a unit is unhealthy
    pub failure_threshold: u64,
    /// Cursor lag (messages behind head) before a consumer is degraded
    pub max_lag: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            max_lag: 10_000,
        }
    }
}

/// Lock-free success/failure counters for one unit.
#[derive(Debug, Default)]
pub struct HealthTracker {
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Total successes.
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Total failures.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Current consecutive-failure run.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Assess health from the counters and an optional cursor lag.
    pub fn assess(&self, lag: Option<u64>, config: &HealthConfig) -> Health {
        let consecutive = self.consecutive_failures();
        if consecutive >= config.failure_threshold {
            return Health::Unhealthy(format!("{consecutive} consecutive failures"));
        }

        if let Some(lag) = lag {
            if lag > config.max_lag {
                return Health::Degraded(format!(
                    "lagging {lag} messages behind head (threshold {})",
                    config.max_lag
                ));
            }
        }

        if consecutive > 0 {
            return Health::Degraded(format!("{consecutive} recent failures"));
        }

        Health::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_by_default() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.assess(None, &HealthConfig::default()), Health::Healthy);
    }

    #[test]
    fn test_consecutive_failures_escalate() {
        let tracker = HealthTracker::new();
        let config = HealthConfig::default();

        tracker.record_failure();
        assert!(matches!(tracker.assess(None, &config), Health::Degraded(_)));

        tracker.record_failure();
        tracker.record_failure();
        assert!(matches!(tracker.assess(None, &config), Health::Unhealthy(_)));
    }

    #[test]
    fn test_success_resets_run() {
        let tracker = HealthTracker::new();
        let config = HealthConfig::default();

        tracker.record_failure();
        tracker.record_failure();
        tracker.record_success();
        assert_eq!(tracker.assess(None, &config), Health::Healthy);
        assert_eq!(tracker.failures(), 2);
        assert_eq!(tracker.successes(), 1);
    }

    #[test]
    fn test_lag_degrades() {
        let tracker = HealthTracker::new();
        let config = HealthConfig {
            failure_threshold: 3,
            max_lag: 100,
        };

        assert_eq!(tracker.assess(Some(50), &config), Health::Healthy);
        assert!(matches!(tracker.assess(Some(101), &config), Health::Degraded(_)));
    }
}
