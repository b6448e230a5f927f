//! Property-based tests for retry delay schedules.

use std::time::Duration;

use proptest::prelude::*;

use taskmill_core::retry::RetryPolicy;

// =============================================================================
// Strategies
// =============================================================================

fn arb_unit_ms() -> impl Strategy<Value = u64> {
    1u64..500
}

fn arb_max_retries() -> impl Strategy<Value = u32> {
    0u32..10
}

// =============================================================================
// Backend admin schedule
// =============================================================================

proptest! {
    #[test]
    fn admin_delay_doubles_up_to_ceiling(unit in arb_unit_ms(), max_retries in arb_max_retries(), attempt in 0u32..16) {
        let policy = RetryPolicy::backend_admin(Duration::from_millis(unit), max_retries);
        let expected = unit * 2u64.pow((attempt + 1).min(max_retries));
        prop_assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(expected));
    }

    #[test]
    fn admin_delay_is_monotonic(unit in arb_unit_ms(), max_retries in arb_max_retries()) {
        let policy = RetryPolicy::backend_admin(Duration::from_millis(unit), max_retries);
        let delays: Vec<Duration> = (0..12).map(|n| policy.delay_for_attempt(n)).collect();
        for pair in delays.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn admin_attempts_are_retries_plus_one(unit in arb_unit_ms(), max_retries in arb_max_retries()) {
        let policy = RetryPolicy::backend_admin(Duration::from_millis(unit), max_retries);
        prop_assert_eq!(policy.max_attempts, max_retries + 1);
    }
}

// =============================================================================
// Failure queue insert schedule
// =============================================================================

proptest! {
    #[test]
    fn queue_insert_delay_is_constant(delay in 0u64..200, tries in 1u32..20, attempt in 0u32..30) {
        let policy = RetryPolicy::queue_insert(Duration::from_millis(delay), tries);
        prop_assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(delay));
        prop_assert_eq!(policy.max_attempts, tries);
    }
}
