use proptest::prelude::*;
use quotaflow::throttling::{LimitAbsolute, LimitConcurrency, WindowSliding};
use quotaflow::{RuleFeedback, Throttling};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Take(u64),
    GiveBack,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(prop_oneof![(1u64..20).prop_map(Op::Take), Just(Op::GiveBack)], 0..64)
}

proptest! {
    #[test]
    fn absolute_admits_exactly_up_to_the_limit(limit in 1u64..200, amounts in prop::collection::vec(1u64..50, 0..64)) {
        let mut throttling = LimitAbsolute::new(Some(limit)).unwrap();
        for amount in amounts {
            let expected = throttling.used() + amount <= limit;
            prop_assert_eq!(throttling.is_available(amount), expected);
            if expected {
                throttling.reserve(amount);
            }
            prop_assert!(throttling.used() <= limit);
        }
    }

    #[test]
    fn concurrency_never_exceeds_the_limit(limit in 1u64..100, ops in ops()) {
        let mut throttling = LimitConcurrency::new(Some(limit)).unwrap();
        let mut held: Vec<u64> = Vec::new();
        for op in ops {
            match op {
                Op::Take(amount) => {
                    let expected = held.iter().sum::<u64>() + amount <= limit;
                    prop_assert_eq!(throttling.is_available(amount), expected);
                    if expected {
                        throttling.reserve(amount);
                        held.push(amount);
                    }
                }
                Op::GiveBack => {
                    if let Some(amount) = held.pop() {
                        throttling.dismiss(amount, &RuleFeedback::default());
                    }
                }
            }
            prop_assert_eq!(throttling.used(), held.iter().sum::<u64>());
            prop_assert!(throttling.used() <= limit);
        }
    }

    #[test]
    fn sliding_expiry_returns_what_was_taken(limit in 1u64..100, amounts in prop::collection::vec(1u64..20, 1..32)) {
        let mut throttling = WindowSliding::new(Some(limit), Some(Duration::from_secs(1))).unwrap();
        let mut taken = Vec::new();
        for amount in amounts {
            if throttling.is_available(amount) {
                let reservation = throttling.reserve(amount);
                prop_assert_eq!(reservation.decays_after, Some(Duration::from_secs(1)));
                taken.push(amount);
            }
        }
        for amount in taken {
            throttling.expire(amount);
        }
        prop_assert_eq!(throttling.used(), 0);
        prop_assert!(throttling.is_available(limit));
    }

    #[test]
    fn learned_limit_replaces_the_old_one(limit in 1u64..100, learned in 1u64..100, used in 0u64..100) {
        let mut throttling = LimitAbsolute::new(Some(limit)).unwrap();
        let used = used.min(limit);
        if used > 0 {
            throttling.reserve(used);
        }
        throttling.dismiss(0, &RuleFeedback::limit(learned));
        prop_assert_eq!(throttling.limit(), Some(learned));
        prop_assert_eq!(throttling.is_available(1), used < learned);
    }
}
