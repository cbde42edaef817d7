//! Abstraction for sleeping/waiting
//!
//! The limiter waits through a `Sleeper` on both faces, which enables fast, deterministic tests
//! without real time delays.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Cooperative sleep for the async face.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Thread sleep for the sync face.
    fn sleep_blocking(&self, duration: Duration);
}

/// Production sleeper: tokio timer for async callers, `thread::sleep` for blocking callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSleeper;

impl Sleeper for SystemSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn sleep_blocking(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }

    fn sleep_blocking(&self, _duration: Duration) {}
}

/// Test sleeper that tracks all sleep calls
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total(&self) -> Duration {
        self.calls().iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(duration);
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.record(duration);
        Box::pin(async {})
    }

    fn sleep_blocking(&self, duration: Duration) {
        self.record(duration);
    }
}

/// Test sleeper that advances a [`ManualClock`] instead of waiting, and records each call.
#[derive(Debug, Clone)]
pub struct AdvancingSleeper {
    clock: ManualClock,
    tracker: TrackingSleeper,
}

impl AdvancingSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, tracker: TrackingSleeper::new() }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.tracker.calls()
    }

    fn advance(&self, duration: Duration) {
        self.tracker.record(duration);
        self.clock.advance(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX));
    }
}

impl Sleeper for AdvancingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.advance(duration);
        Box::pin(async {})
    }

    fn sleep_blocking(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[tokio::test]
    async fn instant_sleeper_doesnt_sleep() {
        let sleeper = InstantSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(10)).await;
        sleeper.sleep_blocking(Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_both_faces() {
        let sleeper = TrackingSleeper::new();

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep_blocking(Duration::from_millis(200));

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(sleeper.total(), Duration::from_millis(300));

        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn advancing_sleeper_moves_manual_clock() {
        let clock = ManualClock::new(1_000);
        let sleeper = AdvancingSleeper::new(clock.clone());

        sleeper.sleep(Duration::from_millis(250)).await;
        sleeper.sleep_blocking(Duration::from_millis(50));

        assert_eq!(clock.now_millis(), 1_300);
        assert_eq!(sleeper.calls().len(), 2);
    }

    #[tokio::test]
    async fn system_sleeper_actually_sleeps() {
        let sleeper = SystemSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45)); // Small tolerance for timing jitter

        let start = std::time::Instant::now();
        sleeper.sleep_blocking(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
