//! Retry delays.

use std::time::Duration;

use rand::Rng;

/// Returns `base * 2^(attempt - 1)`, capped at `max`.
///
/// `attempt` is 1-based; attempt 0 is treated as 1.
#[must_use]
pub fn exponential(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 2_u32.saturating_pow(exponent);
    base.saturating_mul(factor).min(max)
}

/// Adds up to 25% random jitter to `delay`.
#[must_use]
pub fn with_jitter(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    if spread == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=spread);
    delay.saturating_add(Duration::from_millis(extra))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_millis(8_000);
        let delays: Vec<u128> = (1..=7)
            .map(|a| exponential(base, a, max).as_millis())
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
        assert_eq!(exponential(base, 0, max), base);
        assert_eq!(exponential(base, u32::MAX, max), max);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let delay = Duration::from_millis(1_000);
        for _ in 0..100 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(1_250));
        }
        assert_eq!(with_jitter(Duration::from_millis(2)), Duration::from_millis(2));
    }
}
