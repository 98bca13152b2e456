//! Jitter applied to backoff cool-down windows.
//!
//! - `None`: exact delays, for tests.
//! - `Additive(max)`: delay plus a uniform `[0, max]`; the exponential backoff default.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//!
//! Uses `rand`'s thread-local RNG; a deterministic RNG can be passed to `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    None,
    Additive(Duration),
    Full,
    Equal,
}

impl Jitter {
    pub fn additive(max: Duration) -> Self {
        Jitter::Additive(max)
    }

    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Additive(max) => {
                let micros = as_micros_saturated(*max);
                if micros == 0 {
                    return delay;
                }
                delay.saturating_add(Duration::from_micros(rng.random_range(0..=micros)))
            }
            Jitter::Full => {
                let micros = as_micros_saturated(delay);
                if micros == 0 {
                    return Duration::ZERO;
                }
                Duration::from_micros(rng.random_range(0..=micros))
            }
            Jitter::Equal => {
                let micros = as_micros_saturated(delay);
                if micros == 0 {
                    return Duration::ZERO;
                }
                Duration::from_micros(rng.random_range(micros / 2..=micros))
            }
        }
    }
}

fn as_micros_saturated(duration: Duration) -> u64 {
    duration.as_micros().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_exact() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn additive_stays_within_bound() {
        let jitter = Jitter::additive(Duration::from_millis(1));
        for _ in 0..100 {
            let d = jitter.apply(Duration::from_secs(2));
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(2) + Duration::from_millis(1));
        }
    }

    #[test]
    fn full_and_equal_stay_within_delay() {
        let delay = Duration::from_millis(400);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(delay) <= delay);
            let equal = Jitter::Equal.apply(delay);
            assert!(equal >= delay / 2 && equal <= delay);
        }
    }

    #[test]
    fn zero_delay_is_preserved() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::Equal.apply(Duration::ZERO), Duration::ZERO);
    }
}
