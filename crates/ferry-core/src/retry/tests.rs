//! Tests for delay strategies and predicates

use std::time::Duration;

use crate::error::Error;
use crate::retry::strategies::{calculate_delay, RetryPredicate, TransientOnly};
use crate::types::{RetryPolicy, RetryStrategy};

fn policy(strategy: RetryStrategy, initial_delay_ms: u64, max_delay_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        strategy,
        backoff_multiplier: 2.0,
        initial_delay_ms,
        max_delay_ms,
    }
}

#[test]
fn test_strategy_none_always_zero() {
    let policy = policy(RetryStrategy::None, 1000, 30000);
    for attempt in 1..=5 {
        assert_eq!(calculate_delay(&policy, attempt, false), Duration::ZERO);
        assert_eq!(calculate_delay(&policy, attempt, true), Duration::ZERO);
    }
}

#[test]
fn test_strategy_fixed_constant_delay() {
    let policy = policy(RetryStrategy::FixedDelay, 500, 30000);
    for attempt in 1..=5 {
        assert_eq!(
            calculate_delay(&policy, attempt, false),
            Duration::from_millis(500)
        );
    }
}

#[test]
fn test_strategy_exponential_doubles() {
    let policy = policy(RetryStrategy::ExponentialBackoff, 100, 100_000);
    assert_eq!(calculate_delay(&policy, 1, false), Duration::from_millis(100));
    assert_eq!(calculate_delay(&policy, 2, false), Duration::from_millis(200));
    assert_eq!(calculate_delay(&policy, 3, false), Duration::from_millis(400));
    assert_eq!(calculate_delay(&policy, 4, false), Duration::from_millis(800));
}

#[test]
fn test_strategy_linear_grows() {
    let policy = policy(RetryStrategy::LinearBackoff, 100, 100_000);
    assert_eq!(calculate_delay(&policy, 1, false), Duration::from_millis(100));
    assert_eq!(calculate_delay(&policy, 3, false), Duration::from_millis(300));
}

#[test]
fn test_delay_is_capped() {
    let policy = policy(RetryStrategy::ExponentialBackoff, 1000, 3000);
    assert_eq!(calculate_delay(&policy, 5, false), Duration::from_millis(3000));
}

#[test]
fn test_jitter_stays_within_quarter() {
    let policy = policy(RetryStrategy::FixedDelay, 1000, 30000);
    for _ in 0..50 {
        let delay = calculate_delay(&policy, 1, true).as_millis();
        assert!((1000..=1250).contains(&delay), "delay {delay} out of range");
    }
}

#[test]
fn test_transient_only_predicate() {
    assert!(TransientOnly.should_retry(&Error::transient("download", "reset")));
    assert!(!TransientOnly.should_retry(&Error::data_integrity("part", "length")));
    assert!(!TransientOnly.should_retry(&Error::Cancelled));
    assert!(!TransientOnly.should_retry(&Error::QuotaExceeded {
        required: 10,
        available: 1
    }));
}
