//! Millisecond duration symbols used to describe rate intervals.
//!
//! Intervals and timestamps are plain `i64` millisecond counts so that they can be stored
//! unchanged in every backend (SQLite integers, Redis scores, Postgres epoch conversions).

/// One second in milliseconds.
pub const SECOND: i64 = 1_000;
/// One minute in milliseconds.
pub const MINUTE: i64 = 60 * SECOND;
/// One hour in milliseconds.
pub const HOUR: i64 = 60 * MINUTE;
/// One day in milliseconds.
pub const DAY: i64 = 24 * HOUR;
/// One week in milliseconds.
pub const WEEK: i64 = 7 * DAY;

const UNITS: [(i64, &str); 5] = [(WEEK, "w"), (DAY, "d"), (HOUR, "h"), (MINUTE, "m"), (SECOND, "s")];

/// Render a millisecond count using the largest unit that divides it exactly.
///
/// ```
/// use ratewindow::duration::{readable, HOUR, SECOND};
/// assert_eq!(readable(2 * HOUR), "2h");
/// assert_eq!(readable(90 * SECOND), "90s");
/// assert_eq!(readable(1_500), "1500ms");
/// ```
pub fn readable(millis: i64) -> String {
    if millis != 0 {
        for (unit, suffix) in UNITS {
            if millis % unit == 0 {
                return format!("{}{}", millis / unit, suffix);
            }
        }
    }
    format!("{}ms", millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_compose() {
        assert_eq!(MINUTE, 60_000);
        assert_eq!(HOUR, 3_600_000);
        assert_eq!(DAY, 86_400_000);
        assert_eq!(WEEK, 604_800_000);
    }

    #[test]
    fn readable_collapses_to_largest_whole_unit() {
        assert_eq!(readable(SECOND), "1s");
        assert_eq!(readable(3 * WEEK), "3w");
        assert_eq!(readable(DAY + HOUR), "25h");
        assert_eq!(readable(MINUTE + SECOND), "61s");
        assert_eq!(readable(250), "250ms");
        assert_eq!(readable(0), "0ms");
    }
}
