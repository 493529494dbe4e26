//! Duration/tick utilities
//!
//! Wire payloads carry durations as a signed count of 100 ns ticks, so the
//! signed `chrono::TimeDelta` is used instead of `std::time::Duration`.

use chrono::TimeDelta;

/// Ticks per second on the wire (one tick is 100 ns)
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Convert a signed duration to wire ticks
pub fn delta_to_ticks(delta: TimeDelta) -> i64 {
    match delta.num_nanoseconds() {
        Some(nanos) => nanos / 100,
        // Nanosecond count overflowed i64; microseconds still fit.
        None => delta
            .num_microseconds()
            .map(|micros| micros.saturating_mul(10))
            .unwrap_or(i64::MAX),
    }
}

/// Convert wire ticks back to a signed duration
pub fn ticks_to_delta(ticks: i64) -> TimeDelta {
    match ticks.checked_mul(100) {
        Some(nanos) => TimeDelta::nanoseconds(nanos),
        None => TimeDelta::microseconds(ticks.saturating_mul(10)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_round_trip() {
        assert_eq!(ticks_to_delta(0), TimeDelta::zero());
        assert_eq!(delta_to_ticks(TimeDelta::zero()), 0);
    }

    #[test]
    fn test_one_second_is_ten_million_ticks() {
        assert_eq!(delta_to_ticks(TimeDelta::seconds(1)), TICKS_PER_SECOND);
        assert_eq!(ticks_to_delta(TICKS_PER_SECOND), TimeDelta::seconds(1));
    }

    #[test]
    fn test_negative_duration_round_trip() {
        let delta = TimeDelta::milliseconds(-1500);
        assert_eq!(ticks_to_delta(delta_to_ticks(delta)), delta);
    }

    #[test]
    fn test_sub_millisecond_precision() {
        // 250 microseconds = 2500 ticks
        let delta = TimeDelta::microseconds(250);
        assert_eq!(delta_to_ticks(delta), 2500);
        assert_eq!(ticks_to_delta(2500), delta);
    }

    #[test]
    fn test_large_duration_does_not_panic() {
        let delta = ticks_to_delta(i64::MAX);
        assert!(delta > TimeDelta::zero());
    }
}
