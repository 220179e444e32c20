//! Utilities to deal with date-time types. (DateTime, Duration, etc)

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Returns the wall-clock duration from now until `deadline`.
///
/// Returns [`Duration::ZERO`] if the deadline has already passed, so the result
/// can be fed directly into a sleep.
pub fn duration_until(deadline: DateTime<Utc>) -> Duration {
    duration_between(Utc::now(), deadline)
}

/// Returns the duration from `start` to `end`, clamped at zero.
pub fn duration_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

/// Converts a standard library duration into a chrono duration.
///
/// Durations beyond the chrono range saturate at the maximum representable
/// value rather than failing.
pub fn to_chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_between_forward() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(5);
        assert_eq!(duration_between(start, end), Duration::from_secs(5));
    }

    #[test]
    fn test_duration_between_past_clamps() {
        let start = Utc::now();
        let end = start - chrono::Duration::seconds(5);
        assert_eq!(duration_between(start, end), Duration::ZERO);
    }

    #[test]
    fn test_to_chrono_duration_roundtrip() {
        let duration = Duration::from_millis(1500);
        assert_eq!(to_chrono_duration(duration).num_milliseconds(), 1500);
    }
}
