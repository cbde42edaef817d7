//! Rate definitions and timestamped items.

use crate::duration::readable;
use crate::LimiterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// "At most `limit` weight units within any `interval`-millisecond window."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRate")]
pub struct Rate {
    limit: u64,
    interval: i64,
}

#[derive(Deserialize)]
struct RawRate {
    limit: u64,
    interval: i64,
}

impl TryFrom<RawRate> for Rate {
    type Error = LimiterError;

    fn try_from(raw: RawRate) -> Result<Self, Self::Error> {
        Rate::new(raw.limit, raw.interval)
    }
}

impl Rate {
    /// Create a rate. Errors if `limit` or `interval` is zero/negative.
    ///
    /// ```
    /// use ratewindow::{duration::MINUTE, Rate};
    /// let rate = Rate::new(100, MINUTE).unwrap();
    /// assert_eq!(rate.to_string(), "limit=100/1m");
    /// assert!(Rate::new(0, MINUTE).is_err());
    /// ```
    pub fn new(limit: u64, interval: i64) -> Result<Self, LimiterError> {
        if limit == 0 {
            return Err(LimiterError::invalid("rate limit must be > 0"));
        }
        if interval <= 0 {
            return Err(LimiterError::invalid(format!(
                "rate interval must be > 0 (got {}ms)",
                interval
            )));
        }
        Ok(Self { limit, interval })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in milliseconds.
    pub fn interval(&self) -> i64 {
        self.interval
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "limit={}/{}", self.limit, readable(self.interval))
    }
}

/// Check that a rate list is non-empty and strictly ascending in both limit and interval.
pub fn validate_rate_list(rates: &[Rate]) -> Result<(), LimiterError> {
    if rates.is_empty() {
        return Err(LimiterError::invalid("rate list must not be empty"));
    }
    for pair in rates.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.limit >= next.limit || prev.interval >= next.interval {
            return Err(LimiterError::invalid(format!(
                "rates must be strictly ascending in limit and interval: {} then {}",
                prev, next
            )));
        }
    }
    Ok(())
}

/// Largest interval of a validated rate list.
pub(crate) fn max_interval(rates: &[Rate]) -> i64 {
    rates.iter().map(Rate::interval).max().unwrap_or(0)
}

/// An attempt to insert `weight` copies of `name` at `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateItem {
    name: Arc<str>,
    timestamp: i64,
    weight: u64,
}

impl RateItem {
    /// Create an item. Errors if `weight` is zero.
    pub fn new(name: impl Into<Arc<str>>, timestamp: i64, weight: u64) -> Result<Self, LimiterError> {
        if weight == 0 {
            return Err(LimiterError::invalid("item weight must be >= 1"));
        }
        Ok(Self { name: name.into(), timestamp, weight })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn weight(&self) -> u64 {
        self.weight
    }
}

impl fmt::Display for RateItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (weight={})", self.name, self.timestamp, self.weight)
    }
}

/// Locate `value` in a timestamp-ordered slice.
///
/// Returns `0` for an empty slice, `-1` when `value` is newer than every item, and otherwise
/// the index of the first item whose timestamp is `>= value`.
pub fn binary_search(items: &[RateItem], value: i64) -> i64 {
    match items.last() {
        None => 0,
        Some(newest) if value > newest.timestamp => -1,
        Some(_) => items.partition_point(|item| item.timestamp < value) as i64,
    }
}
