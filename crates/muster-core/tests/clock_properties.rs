//! Property tests for vector clock ordering and backoff schedules.

#![allow(clippy::doc_markdown, clippy::needless_pass_by_value)]

use std::time::Duration;

use muster_core::{coordination::backoff_delay, ClockOrdering, VectorClock};
use proptest::prelude::*;

// =============================================================================
// STRATEGIES
// =============================================================================

fn clock_strategy() -> impl Strategy<Value = VectorClock> {
    prop::collection::btree_map("[a-e]", 0u64..6, 0..5).prop_map(|m| m.into_iter().collect())
}

// =============================================================================
// VECTOR CLOCK
// =============================================================================

proptest! {
    #[test]
    fn compare_is_reflexive(a in clock_strategy()) {
        prop_assert_eq!(a.compare(&a), ClockOrdering::Equal);
    }

    #[test]
    fn compare_is_antisymmetric(a in clock_strategy(), b in clock_strategy()) {
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
    }

    #[test]
    fn merge_dominates_both_inputs(a in clock_strategy(), b in clock_strategy()) {
        let m = a.merged(&b);
        prop_assert!(m.dominates(&a));
        prop_assert!(m.dominates(&b));
    }

    #[test]
    fn merge_is_commutative(a in clock_strategy(), b in clock_strategy()) {
        prop_assert_eq!(a.merged(&b).compare(&b.merged(&a)), ClockOrdering::Equal);
    }

    #[test]
    fn merge_is_idempotent(a in clock_strategy(), b in clock_strategy()) {
        let once = a.merged(&b);
        prop_assert_eq!(once.merged(&b).compare(&once), ClockOrdering::Equal);
    }

    #[test]
    fn increment_moves_strictly_after(a in clock_strategy(), worker in "[a-g]") {
        let mut next = a.clone();
        let counter = next.increment(&worker);
        prop_assert_eq!(counter, a.get(&worker) + 1);
        prop_assert_eq!(next.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn increments_on_different_workers_are_concurrent(a in clock_strategy()) {
        let mut left = a.clone();
        let mut right = a;
        left.increment("left");
        right.increment("right");
        prop_assert_eq!(left.compare(&right), ClockOrdering::Concurrent);
    }

    #[test]
    fn transitivity_of_before(a in clock_strategy(), w1 in "[a-e]", w2 in "[a-e]") {
        let mut b = a.clone();
        b.increment(&w1);
        let mut c = b.clone();
        c.increment(&w2);
        prop_assert_eq!(a.compare(&b), ClockOrdering::Before);
        prop_assert_eq!(b.compare(&c), ClockOrdering::Before);
        prop_assert_eq!(a.compare(&c), ClockOrdering::Before);
    }
}

// =============================================================================
// BACKOFF
// =============================================================================

proptest! {
    #[test]
    fn backoff_is_monotonic_and_capped(
        initial_ms in 1u64..2_000,
        cap_factor in 1u64..64,
        attempt in 0u32..40,
    ) {
        let initial = Duration::from_millis(initial_ms);
        let max = Duration::from_millis(initial_ms * cap_factor);
        let now = backoff_delay(attempt, initial, max);
        let next = backoff_delay(attempt + 1, initial, max);

        prop_assert!(now <= next);
        prop_assert!(next <= max);
        prop_assert!(now >= initial.min(max));
    }
}
