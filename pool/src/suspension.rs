//! Failure-driven suspension of a connection (circuit breaker).
//!
//! ```text
//! HEALTHY --failure, count reaches max--> SUSPENDED (until = now + backoff)
//! SUSPENDED --attempt before until--> rejected, backend not touched
//! SUSPENDED --attempt after until--> probe: success -> HEALTHY, failure -> SUSPENDED
//! ```
//!
//! The failure count keeps growing across probe cycles and resets only on success, so a
//! failed probe suspends again straight away. The k-th consecutive suspension lasts
//! `backoff * multiplier^(k-1)`, capped by `max_backoff`.

use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for a grown suspension when no explicit cap is configured.
pub const MAX_SUSPENSION: Duration = Duration::from_secs(24 * 60 * 60);

const MIN_SUSPENSION: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspensionConfig {
    /// Consecutive failures that trigger a suspension, 0 disables suspension
    pub max_failure_retry_count: u32,
    pub backoff: Duration,
    pub backoff_multiplier: u32,
    pub max_backoff: Option<Duration>,
}

impl SuspensionConfig {
    #[must_use]
    pub fn fixed(max_failure_retry_count: u32, backoff: Duration) -> Self {
        Self {
            max_failure_retry_count,
            backoff,
            backoff_multiplier: 1,
            max_backoff: None,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Length of the `suspensions`-th consecutive suspension (1-based).
    #[must_use]
    pub fn backoff_for(&self, suspensions: u32) -> Duration {
        let cap = self.max_backoff.unwrap_or(MAX_SUSPENSION);
        let exponent = suspensions.saturating_sub(1);
        let grown = self
            .backoff_multiplier
            .max(1)
            .checked_pow(exponent)
            .and_then(|factor| self.backoff.checked_mul(factor))
            .unwrap_or(cap);
        grown.min(cap).max(MIN_SUSPENSION)
    }
}

impl From<&common::ConnectionConfig> for SuspensionConfig {
    fn from(config: &common::ConnectionConfig) -> Self {
        Self {
            max_failure_retry_count: config.max_failure_retry_count,
            backoff: config.suspend_duration,
            backoff_multiplier: config.backoff_multiplier,
            max_backoff: config.max_backoff,
        }
    }
}

/// Point-in-time view of a connection's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub state: HealthState,
    pub failure_count: u32,
    /// Consecutive suspensions since the last success
    pub suspensions: u32,
    /// Time left until the next attempt is let through, zero when healthy or probing
    pub remaining: Duration,
}

#[derive(Debug, Default)]
struct State {
    failure_count: u32,
    suspensions: u32,
    suspended_until: Option<Instant>,
}

/// What recording a failure did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still below the threshold (or suspension disabled)
    Counted { failure_count: u32 },
    /// The connection was (re-)suspended for `backoff`
    Suspended { failure_count: u32, backoff: Duration },
}

#[derive(Debug)]
pub struct SuspensionPolicy {
    config: SuspensionConfig,
    state: parking_lot::Mutex<State>,
}

impl SuspensionPolicy {
    #[must_use]
    pub fn new(config: SuspensionConfig) -> Self {
        Self {
            config,
            state: parking_lot::Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &SuspensionConfig {
        &self.config
    }

    /// Lets an attempt through, or returns the time left in the current suspension.
    pub fn admit(&self) -> Result<(), Duration> {
        let state = self.state.lock();
        match state.suspended_until {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    Err(until - now)
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    /// Returns `true` if this success ended a suspension.
    pub fn record_success(&self) -> bool {
        let mut state = self.state.lock();
        let recovered = state.suspended_until.is_some();
        *state = State::default();
        recovered
    }

    pub fn record_failure(&self) -> FailureOutcome {
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        let failure_count = state.failure_count;
        if self.config.max_failure_retry_count == 0
            || failure_count < self.config.max_failure_retry_count
        {
            return FailureOutcome::Counted { failure_count };
        }
        let now = Instant::now();
        if state.suspended_until.is_some_and(|until| now < until) {
            // an attempt admitted before the suspension started has failed too
            return FailureOutcome::Counted { failure_count };
        }
        state.suspensions = state.suspensions.saturating_add(1);
        let backoff = self.config.backoff_for(state.suspensions);
        state.suspended_until = Some(now + backoff);
        FailureOutcome::Suspended {
            failure_count,
            backoff,
        }
    }

    pub fn health(&self) -> Health {
        let state = self.state.lock();
        let now = Instant::now();
        Health {
            state: if state.suspended_until.is_some() {
                HealthState::Suspended
            } else {
                HealthState::Healthy
            },
            failure_count: state.failure_count,
            suspensions: state.suspensions,
            remaining: state
                .suspended_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_does_not_grow() {
        let config = SuspensionConfig::fixed(3, Duration::from_secs(5));
        assert_eq!(config.backoff_for(1), Duration::from_secs(5));
        assert_eq!(config.backoff_for(4), Duration::from_secs(5));
    }

    #[test]
    fn grown_backoff_is_capped() {
        let config = SuspensionConfig {
            max_failure_retry_count: 1,
            backoff: Duration::from_secs(1),
            backoff_multiplier: 2,
            max_backoff: Some(Duration::from_secs(10)),
        };
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for(4), Duration::from_secs(8));
        assert_eq!(config.backoff_for(5), Duration::from_secs(10));
        assert_eq!(config.backoff_for(200), Duration::from_secs(10));
    }

    #[test]
    fn unbounded_growth_stops_at_max_suspension() {
        let config = SuspensionConfig {
            max_failure_retry_count: 1,
            backoff: Duration::from_secs(60),
            backoff_multiplier: 10,
            max_backoff: None,
        };
        assert_eq!(config.backoff_for(40), MAX_SUSPENSION);
    }

    #[tokio::test(start_paused = true)]
    async fn suspends_when_threshold_is_reached() {
        let policy = SuspensionPolicy::new(SuspensionConfig::fixed(2, Duration::from_secs(5)));
        assert_eq!(
            policy.record_failure(),
            FailureOutcome::Counted { failure_count: 1 }
        );
        assert!(policy.admit().is_ok());
        assert_eq!(
            policy.record_failure(),
            FailureOutcome::Suspended {
                failure_count: 2,
                backoff: Duration::from_secs(5)
            }
        );
        assert_eq!(policy.admit(), Err(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(policy.admit(), Err(Duration::from_secs(3)));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(policy.admit().is_ok());
        assert_eq!(policy.health().state, HealthState::Suspended);
        assert!(policy.record_success());
        assert_eq!(
            policy.health(),
            Health {
                state: HealthState::Healthy,
                failure_count: 0,
                suspensions: 0,
                remaining: Duration::ZERO,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_suspends_again_with_grown_backoff() {
        let policy = SuspensionPolicy::new(SuspensionConfig {
            max_failure_retry_count: 1,
            backoff: Duration::from_secs(1),
            backoff_multiplier: 3,
            max_backoff: None,
        });
        policy.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(policy.admit().is_ok());
        assert_eq!(
            policy.record_failure(),
            FailureOutcome::Suspended {
                failure_count: 2,
                backoff: Duration::from_secs(3)
            }
        );
        let health = policy.health();
        assert_eq!(health.suspensions, 2);
        assert_eq!(health.remaining, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_does_not_extend_running_suspension() {
        let policy = SuspensionPolicy::new(SuspensionConfig::fixed(1, Duration::from_secs(5)));
        policy.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            policy.record_failure(),
            FailureOutcome::Counted { failure_count: 2 }
        );
        assert_eq!(policy.health().remaining, Duration::from_secs(4));
    }

    #[test]
    fn disabled_policy_never_suspends() {
        let policy = SuspensionPolicy::new(SuspensionConfig::disabled());
        for expected in 1..=10 {
            assert_eq!(
                policy.record_failure(),
                FailureOutcome::Counted {
                    failure_count: expected
                }
            );
        }
        assert!(policy.admit().is_ok());
        assert!(!policy.record_success());
    }
}
