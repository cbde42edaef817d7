//! Clock abstractions feeding item timestamps.
//!
//! A factory owns exactly one clock and every timestamp in its buckets comes from it, so values
//! are only ever compared against other readings of the same clock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// Two successive readings never go backwards.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// Clock whose reading requires an await (e.g. a database round trip).
#[async_trait]
pub trait AsyncClock: Send + Sync + std::fmt::Debug {
    async fn now_millis(&self) -> i64;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Notes: resets when the process restarts; use [`SystemClock`] when timestamps are shared with
/// other processes through a backend.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Wall clock in milliseconds since the Unix epoch, clamped so it never steps backwards.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let now = epoch_millis();
        let prev = self.last.fetch_max(now, Ordering::AcqRel);
        prev.max(now)
    }
}

/// Hand-driven clock for deterministic tests. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self { now: Arc::new(AtomicI64::new(start)) }
    }

    /// Move the clock forward by `millis` (negative values are ignored).
    pub fn advance(&self, millis: i64) {
        if millis > 0 {
            self.now.fetch_add(millis, Ordering::AcqRel);
        }
    }

    /// Jump to `millis` if it is later than the current reading.
    pub fn set(&self, millis: i64) {
        self.now.fetch_max(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Presents a synchronous clock through the async interface.
#[derive(Debug, Clone)]
pub struct AsyncClockAdapter<C> {
    inner: C,
}

impl<C: Clock> AsyncClockAdapter<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: Clock> AsyncClock for AsyncClockAdapter<C> {
    async fn now_millis(&self) -> i64 {
        self.inner.now_millis()
    }
}

/// The clock a factory reads from.
#[derive(Debug, Clone)]
pub enum ClockSource {
    Sync(Arc<dyn Clock>),
    Async(Arc<dyn AsyncClock>),
}

impl ClockSource {
    pub fn sync<C: Clock + 'static>(clock: C) -> Self {
        Self::Sync(Arc::new(clock))
    }

    pub fn asynchronous<C: AsyncClock + 'static>(clock: C) -> Self {
        Self::Async(Arc::new(clock))
    }

    /// Read the clock from a synchronous context. `None` for async clocks.
    pub fn now_blocking(&self) -> Option<i64> {
        match self {
            Self::Sync(clock) => Some(clock.now_millis()),
            Self::Async(_) => None,
        }
    }

    pub async fn now(&self) -> i64 {
        match self {
            Self::Sync(clock) => clock.now_millis(),
            Self::Async(clock) => clock.now_millis().await,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl Default for ClockSource {
    fn default() -> Self {
        Self::sync(SystemClock::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::default();
        let mut prev = clock.now_millis();
        for _ in 0..1_000 {
            let now = clock.now_millis();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn system_clock_is_epoch_scaled() {
        let clock = SystemClock::new();
        let now = clock.now_millis();
        // 2020-01-01 in epoch millis
        assert!(now > 1_577_836_800_000);
        assert!(clock.now_millis() >= now);
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        clock.advance(50);
        assert_eq!(other.now_millis(), 150);
        other.set(120);
        assert_eq!(clock.now_millis(), 150);
        other.set(1_000);
        clock.advance(-10);
        assert_eq!(clock.now_millis(), 1_000);
    }

    #[tokio::test]
    async fn clock_source_dispatches_both_kinds() {
        let manual = ManualClock::new(42);
        let sync = ClockSource::sync(manual.clone());
        let asynchronous = ClockSource::asynchronous(AsyncClockAdapter::new(manual));

        assert_eq!(sync.now_blocking(), Some(42));
        assert_eq!(asynchronous.now_blocking(), None);
        assert_eq!(sync.now().await, 42);
        assert_eq!(asynchronous.now().await, 42);
        assert!(asynchronous.is_async());
    }
}
