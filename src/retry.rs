//! Reconnection retry policy
//!
//! Pure decision logic: given the number of the attempt about to be made,
//! decide whether to make it and how long to wait first. The
//! [`crate::connection::ConnectionManager`] owns the attempt counter.

use crate::config::{keys, BrokerProperties, ConfigError};
use std::fmt;
use std::time::Duration;

const DEFAULT_RECONNECTION_INTERVAL_MS: u64 = 3_000;

/// How to react when an established session drops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Give up on the first drop
    #[default]
    NeverRetry,
    /// Retry with a fixed interval until shut down
    ForeverRetry { interval: Duration },
    /// Retry up to `max_attempts` times with a fixed interval
    ParametrizedRetry { max_attempts: u32, interval: Duration },
}

/// Outcome of [`RetryStrategy::next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub wait: Duration,
    pub proceed: bool,
}

impl RetryDecision {
    fn stop() -> Self {
        Self {
            wait: Duration::ZERO,
            proceed: false,
        }
    }

    fn after(wait: Duration) -> Self {
        Self {
            wait,
            proceed: true,
        }
    }
}

impl RetryStrategy {
    pub fn never_retry() -> Self {
        RetryStrategy::NeverRetry
    }

    pub fn forever_retry(interval: Duration) -> Self {
        RetryStrategy::ForeverRetry { interval }
    }

    /// Zero attempts behaves like [`RetryStrategy::NeverRetry`]
    pub fn parametrized_retry(max_attempts: u32, interval: Duration) -> Self {
        RetryStrategy::ParametrizedRetry {
            max_attempts,
            interval,
        }
    }

    /// Decide whether attempt number `attempt` (1-based) should be made
    pub fn next(&self, attempt: u32) -> RetryDecision {
        match *self {
            RetryStrategy::NeverRetry => RetryDecision::stop(),
            RetryStrategy::ForeverRetry { interval } => RetryDecision::after(interval),
            RetryStrategy::ParametrizedRetry {
                max_attempts,
                interval,
            } => {
                if attempt <= max_attempts {
                    RetryDecision::after(interval)
                } else {
                    RetryDecision::stop()
                }
            }
        }
    }

    /// Attempt budget, `None` when unbounded
    pub fn max_attempts(&self) -> Option<u32> {
        match *self {
            RetryStrategy::NeverRetry => Some(0),
            RetryStrategy::ForeverRetry { .. } => None,
            RetryStrategy::ParametrizedRetry { max_attempts, .. } => Some(max_attempts),
        }
    }

    /// Upper bound on the time spent sleeping during one episode
    pub fn max_total_wait(&self) -> Option<Duration> {
        match *self {
            RetryStrategy::NeverRetry => Some(Duration::ZERO),
            RetryStrategy::ForeverRetry { .. } => None,
            RetryStrategy::ParametrizedRetry {
                max_attempts,
                interval,
            } => Some(interval.saturating_mul(max_attempts)),
        }
    }

    /// Strategy from `reconnection.attempts` / `reconnection.interval`;
    /// `None` when no attempt count is configured
    pub fn from_properties(props: &BrokerProperties) -> Result<Option<Self>, ConfigError> {
        let Some(attempts) = props.get_i64(keys::RECONNECTION_ATTEMPTS)? else {
            return Ok(None);
        };

        let interval = props
            .get_millis(keys::RECONNECTION_INTERVAL_MS)?
            .unwrap_or(Duration::from_millis(DEFAULT_RECONNECTION_INTERVAL_MS));

        let strategy = match attempts {
            -1 => RetryStrategy::forever_retry(interval),
            0 => RetryStrategy::never_retry(),
            n if n > 0 => {
                let max_attempts = u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
                    key: keys::RECONNECTION_ATTEMPTS.to_string(),
                    value: n.to_string(),
                    reason: "attempt count too large".to_string(),
                })?;
                RetryStrategy::parametrized_retry(max_attempts, interval)
            }
            n => {
                return Err(ConfigError::InvalidValue {
                    key: keys::RECONNECTION_ATTEMPTS.to_string(),
                    value: n.to_string(),
                    reason: "expected -1 (forever), 0 (never) or a positive count".to_string(),
                })
            }
        };

        Ok(Some(strategy))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let RetryStrategy::ForeverRetry { interval } = self {
            if interval.is_zero() {
                return Err(ConfigError::InvalidConfig(
                    "ForeverRetry requires a non-zero interval".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::NeverRetry => write!(f, "never"),
            RetryStrategy::ForeverRetry { interval } => write!(f, "forever every {interval:?}"),
            RetryStrategy::ParametrizedRetry {
                max_attempts,
                interval,
            } => write!(f, "{max_attempts} attempts every {interval:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_never_retry_stops_immediately() {
        let decision = RetryStrategy::never_retry().next(1);
        assert!(!decision.proceed);
    }

    #[test]
    fn test_forever_retry_uses_fixed_interval() {
        let strategy = RetryStrategy::forever_retry(Duration::from_millis(500));
        for attempt in [1, 2, 10, 10_000] {
            assert_eq!(
                strategy.next(attempt),
                RetryDecision {
                    wait: Duration::from_millis(500),
                    proceed: true
                }
            );
        }
        assert_eq!(strategy.max_attempts(), None);
        assert_eq!(strategy.max_total_wait(), None);
    }

    #[test]
    fn test_parametrized_retry_budget() {
        let strategy = RetryStrategy::parametrized_retry(3, Duration::from_secs(1));
        assert!(strategy.next(1).proceed);
        assert!(strategy.next(3).proceed);
        assert!(!strategy.next(4).proceed);
        assert_eq!(strategy.max_total_wait(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_parametrized_zero_behaves_as_never() {
        let strategy = RetryStrategy::parametrized_retry(0, Duration::from_secs(1));
        assert!(!strategy.next(1).proceed);
    }

    #[test]
    fn test_default_is_never_retry() {
        assert_eq!(RetryStrategy::default(), RetryStrategy::NeverRetry);
    }

    #[test]
    fn test_from_properties() {
        let props = |attempts: &str| {
            BrokerProperties::from_pairs([
                (keys::RECONNECTION_ATTEMPTS, attempts),
                (keys::RECONNECTION_INTERVAL_MS, "250"),
            ])
        };

        assert_eq!(
            RetryStrategy::from_properties(&props("-1")).unwrap(),
            Some(RetryStrategy::forever_retry(Duration::from_millis(250)))
        );
        assert_eq!(
            RetryStrategy::from_properties(&props("0")).unwrap(),
            Some(RetryStrategy::NeverRetry)
        );
        assert_eq!(
            RetryStrategy::from_properties(&props("7")).unwrap(),
            Some(RetryStrategy::parametrized_retry(7, Duration::from_millis(250)))
        );
        assert!(RetryStrategy::from_properties(&props("-5")).is_err());
        assert_eq!(
            RetryStrategy::from_properties(&BrokerProperties::new()).unwrap(),
            None
        );
    }

    #[test]
    fn test_interval_defaults_to_three_seconds() {
        let props = BrokerProperties::from_pairs([(keys::RECONNECTION_ATTEMPTS, "2")]);
        assert_eq!(
            RetryStrategy::from_properties(&props).unwrap(),
            Some(RetryStrategy::parametrized_retry(2, Duration::from_secs(3)))
        );
    }

    #[test]
    fn test_forever_retry_with_zero_interval_is_invalid() {
        assert!(RetryStrategy::forever_retry(Duration::ZERO).validate().is_err());
        assert!(RetryStrategy::parametrized_retry(3, Duration::ZERO)
            .validate()
            .is_ok());
    }

    proptest! {
        #[test]
        fn prop_parametrized_proceeds_exactly_max_times(max in 0u32..200, interval_ms in 0u64..10_000) {
            let strategy = RetryStrategy::parametrized_retry(max, Duration::from_millis(interval_ms));
            let proceeding = (1..=max + 50).filter(|a| strategy.next(*a).proceed).count();
            prop_assert_eq!(proceeding as u32, max);
        }

        #[test]
        fn prop_wait_is_fixed(attempt in 1u32..10_000, interval_ms in 1u64..60_000) {
            let interval = Duration::from_millis(interval_ms);
            prop_assert_eq!(RetryStrategy::forever_retry(interval).next(attempt).wait, interval);
        }
    }
}
