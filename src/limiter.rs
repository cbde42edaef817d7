//! The acquisition protocol.
//!
//! Every acquisition takes the limiter's lock set (bucket-provided cross-process locks, then the
//! limiter's own [`ProcessLock`]), stamps an item through the factory, and tries to `put` it.
//! A rejected item waits for `bucket.waiting(item) + buffer`, then retries with a fresh
//! timestamp. The same steps run on both faces; only how waits are realized differs.
//!
//! ```
//! use ratewindow::{AcquireOptions, InMemoryBucket, Limiter, Rate};
//! use std::sync::Arc;
//! let bucket = InMemoryBucket::new(vec![Rate::new(1, 60_000).unwrap()]).unwrap();
//! let limiter = Limiter::new(Arc::new(bucket)).unwrap();
//! assert!(limiter.try_acquire("job", 1).unwrap());
//! assert!(!limiter.try_acquire_with("job", 1, AcquireOptions::non_blocking()).unwrap());
//! ```

use crate::bucket::{Bucket, BucketHandle};
use crate::clock::ClockSource;
use crate::config::{LimiterConfig, DEFAULT_BUFFER_MS};
use crate::decorator::LimiterDecorator;
use crate::factory::{BucketFactory, DefaultBucketFactory};
use crate::lock::{LockSet, ProcessLock, TimedLock};
use crate::rate::{Rate, RateItem};
use crate::sleeper::{Sleeper, SystemSleeper};
use crate::{InMemoryBucket, LimiterError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Back-off before retrying after a transient backend error.
pub const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// How a limiter reacts to rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Return `BucketFull`/`LimiterDelay` errors instead of `Ok(false)`.
    pub raise_when_fail: bool,
    /// Upper bound on accumulated waiting. `None` is unbounded; zero never waits.
    pub max_delay: Option<Duration>,
    /// Keep retrying until `max_delay` is spent instead of retrying once.
    pub retry_until_max_delay: bool,
    /// Padding added to every computed wait.
    pub buffer: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            raise_when_fail: false,
            max_delay: None,
            retry_until_max_delay: false,
            buffer: Duration::from_millis(DEFAULT_BUFFER_MS),
        }
    }
}

/// Per-call acquisition options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    pub blocking: bool,
    /// Total budget for the call, lock acquisition included.
    pub timeout: Option<Duration>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self::blocking()
    }
}

impl AcquireOptions {
    pub fn blocking() -> Self {
        Self { blocking: true, timeout: None }
    }

    pub fn non_blocking() -> Self {
        Self { blocking: false, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What to do after a rejected `put`.
#[derive(Debug)]
pub(crate) enum Step {
    Sleep(Duration),
    /// The deadline ends before the wait does: sleep out the rest, then give up.
    Expire(Duration),
    Reject(LimiterError),
}

/// Retry bookkeeping for one acquisition.
#[derive(Debug)]
pub(crate) struct Attempt<'a> {
    name: &'a str,
    weight: u64,
    policy: Policy,
    blocking: bool,
    deadline: Option<Instant>,
    delayed: Duration,
    retried: bool,
}

impl<'a> Attempt<'a> {
    pub(crate) fn new(name: &'a str, weight: u64, policy: Policy, options: AcquireOptions, started: Instant) -> Self {
        Self {
            name,
            weight,
            policy,
            blocking: options.blocking,
            deadline: options.timeout.map(|t| started + t),
            delayed: Duration::ZERO,
            retried: false,
        }
    }

    fn bucket_full(&self, rate: Option<Rate>) -> Step {
        Step::Reject(LimiterError::BucketFull { name: self.name.to_string(), weight: self.weight, rate })
    }

    /// Decide the next step given the wait (buffer included) the bucket requires.
    pub(crate) fn on_denied(&mut self, required: Duration, rate: Option<Rate>, now: Instant) -> Step {
        if !self.blocking || self.policy.max_delay == Some(Duration::ZERO) {
            return self.bucket_full(rate);
        }
        if self.retried && !self.policy.retry_until_max_delay {
            return self.bucket_full(rate);
        }
        let total = self.delayed + required;
        if let Some(max) = self.policy.max_delay {
            if total > max {
                return Step::Reject(LimiterError::LimiterDelay {
                    name: self.name.to_string(),
                    weight: self.weight,
                    required_delay: total.as_millis() as u64,
                    max_delay: max.as_millis() as u64,
                });
            }
        }
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(now);
            if remaining < required {
                return Step::Expire(remaining);
            }
        }
        self.delayed = total;
        self.retried = true;
        Step::Sleep(required)
    }
}

/// Outcome of a single put + waiting round.
enum Round {
    Admitted,
    Denied { wait: i64, rate: Option<Rate> },
    Transient(LimiterError),
}

fn weight_exceeded(item: &RateItem, rate: Option<Rate>) -> LimiterError {
    LimiterError::WeightExceedsCapacity {
        name: item.name().to_string(),
        weight: item.weight(),
        limit: rate.map(|r| r.limit()).unwrap_or(0),
    }
}

/// Sliding-window limiter over a [`BucketFactory`].
pub struct Limiter {
    factory: Arc<dyn BucketFactory>,
    owns_factory: bool,
    closed: AtomicBool,
    policy: Policy,
    lock: Arc<ProcessLock>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("factory", &self.factory)
            .field("policy", &self.policy)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl Limiter {
    /// Limiter over a single bucket with default policies and a [`crate::SystemClock`].
    pub fn new(bucket: impl Into<BucketHandle>) -> Result<Self, LimiterError> {
        Self::builder().bucket(bucket).build()
    }

    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::default()
    }

    /// In-memory limiter built from `config.rates` with the configured policies.
    pub fn from_config(config: &LimiterConfig) -> Result<Self, LimiterError> {
        config.validate()?;
        let bucket = InMemoryBucket::new(config.rates.clone())?;
        Self::builder().bucket(Arc::new(bucket)).config(config).build()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn factory(&self) -> &Arc<dyn BucketFactory> {
        &self.factory
    }

    /// Wrap callables so each call acquires first; see [`LimiterDecorator`].
    pub fn as_decorator<M>(self: &Arc<Self>, mapping: M) -> LimiterDecorator<M> {
        LimiterDecorator::new(self.clone(), mapping)
    }

    fn lock_set(&self) -> LockSet {
        let mut locks = self.factory.limiter_locks();
        locks.push(self.lock.clone() as Arc<dyn TimedLock>);
        LockSet::new(locks)
    }

    fn finish(&self, err: LimiterError) -> Result<bool, LimiterError> {
        if self.policy.raise_when_fail {
            return Err(err);
        }
        debug!(target: "ratewindow::limiter", error = %err, "acquisition refused");
        Ok(false)
    }

    fn validate(&self, weight: u64) -> Result<(), LimiterError> {
        if weight == 0 {
            return Err(LimiterError::invalid("weight must be >= 1"));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(LimiterError::invalid("limiter is closed"));
        }
        Ok(())
    }

    fn round_sync(bucket: &Arc<dyn Bucket>, item: &RateItem) -> Result<Round, LimiterError> {
        let outcome = bucket.put(item).and_then(|admitted| {
            if admitted {
                Ok(Round::Admitted)
            } else {
                Ok(Round::Denied { wait: bucket.waiting(item)?, rate: bucket.failing_rate() })
            }
        });
        match outcome {
            Err(err) if err.is_transient() => Ok(Round::Transient(err)),
            other => other,
        }
    }

    async fn round_async(bucket: &BucketHandle, item: &RateItem) -> Result<Round, LimiterError> {
        let outcome = match bucket.put(item).await {
            Ok(true) => Ok(Round::Admitted),
            Ok(false) => match bucket.waiting(item).await {
                Ok(wait) => Ok(Round::Denied { wait, rate: bucket.failing_rate() }),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        match outcome {
            Err(err) if err.is_transient() => Ok(Round::Transient(err)),
            other => other,
        }
    }

    /// Turn a round into the next step, or an immediate result.
    fn next_step(
        &self,
        attempt: &mut Attempt<'_>,
        item: &RateItem,
        round: Round,
    ) -> Result<Option<Step>, LimiterError> {
        let (required, rate) = match round {
            Round::Admitted => return Ok(None),
            Round::Denied { wait, rate } => {
                if wait < 0 {
                    return Err(weight_exceeded(item, rate));
                }
                let required = Duration::from_millis(wait as u64) + self.policy.buffer;
                debug!(target: "ratewindow::limiter", name = %item.name(), weight = item.weight(), wait_ms = wait, "bucket full");
                (required, rate)
            }
            Round::Transient(err) => {
                warn!(target: "ratewindow::limiter", name = %item.name(), error = %err, "transient backend error; backing off");
                (TRANSIENT_BACKOFF, None)
            }
        };
        Ok(Some(attempt.on_denied(required, rate, Instant::now())))
    }

    /// Acquire `weight` units for `name`, blocking as policy allows.
    pub fn try_acquire(&self, name: &str, weight: u64) -> Result<bool, LimiterError> {
        self.try_acquire_with(name, weight, AcquireOptions::default())
    }

    /// Synchronous acquisition. Requires a sync clock and sync buckets.
    pub fn try_acquire_with(&self, name: &str, weight: u64, options: AcquireOptions) -> Result<bool, LimiterError> {
        self.validate(weight)?;
        let started = Instant::now();
        let _guard = match self.lock_set().acquire(options.timeout) {
            Ok(guard) => guard,
            Err(timeout) => {
                debug!(target: "ratewindow::limiter", name, error = %timeout, "lock acquisition timed out");
                return Ok(false);
            }
        };

        let mut attempt = Attempt::new(name, weight, self.policy, options, started);
        loop {
            let item = self.factory.wrap_item(name, weight)?;
            let handle = self.factory.get(&item)?;
            let bucket = handle.as_sync().ok_or_else(|| {
                LimiterError::invalid("bucket is async; use try_acquire_async")
            })?;
            let round = Self::round_sync(bucket, &item)?;
            match self.next_step(&mut attempt, &item, round)? {
                None => return Ok(true),
                Some(Step::Sleep(wait)) => self.sleeper.sleep_blocking(wait),
                Some(Step::Expire(rest)) => {
                    self.sleeper.sleep_blocking(rest);
                    debug!(target: "ratewindow::limiter", name, "timed out while waiting");
                    return Ok(false);
                }
                Some(Step::Reject(err)) => return self.finish(err),
            }
        }
    }

    pub async fn try_acquire_async(&self, name: &str, weight: u64) -> Result<bool, LimiterError> {
        self.try_acquire_async_with(name, weight, AcquireOptions::default()).await
    }

    /// Async acquisition; works with every bucket and clock kind. Dropping the future releases
    /// held locks and leaves buckets untouched unless a `put` already completed.
    pub async fn try_acquire_async_with(
        &self,
        name: &str,
        weight: u64,
        options: AcquireOptions,
    ) -> Result<bool, LimiterError> {
        self.validate(weight)?;
        let started = Instant::now();
        let _guard = match self.lock_set().acquire_async(options.timeout).await {
            Ok(guard) => guard,
            Err(timeout) => {
                debug!(target: "ratewindow::limiter", name, error = %timeout, "lock acquisition timed out");
                return Ok(false);
            }
        };

        let mut attempt = Attempt::new(name, weight, self.policy, options, started);
        loop {
            let item = self.factory.wrap_item_async(name, weight).await?;
            let bucket = self.factory.get(&item)?;
            let round = Self::round_async(&bucket, &item).await?;
            match self.next_step(&mut attempt, &item, round)? {
                None => return Ok(true),
                Some(Step::Sleep(wait)) => self.sleeper.sleep(wait).await,
                Some(Step::Expire(rest)) => {
                    self.sleeper.sleep(rest).await;
                    debug!(target: "ratewindow::limiter", name, "timed out while waiting");
                    return Ok(false);
                }
                Some(Step::Reject(err)) => return self.finish(err),
            }
        }
    }

    /// Close the factory if this limiter created it. Idempotent.
    pub fn close(&self) -> Result<(), LimiterError> {
        if self.closed.swap(true, Ordering::AcqRel) || !self.owns_factory {
            return Ok(());
        }
        self.factory.close()
    }

    pub async fn close_async(&self) -> Result<(), LimiterError> {
        if self.closed.swap(true, Ordering::AcqRel) || !self.owns_factory {
            return Ok(());
        }
        self.factory.close_async().await
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(target: "ratewindow::limiter", error = %err, "closing limiter factory failed");
        }
    }
}

/// Builder for [`Limiter`].
#[derive(Default)]
pub struct LimiterBuilder {
    bucket: Option<BucketHandle>,
    factory: Option<Arc<dyn BucketFactory>>,
    clock: Option<ClockSource>,
    leak_interval: Option<Duration>,
    policy: Policy,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl LimiterBuilder {
    /// Serve every name from `bucket` through a factory owned by the limiter.
    pub fn bucket(mut self, bucket: impl Into<BucketHandle>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Use a caller-owned factory; the limiter never closes it.
    pub fn factory(mut self, factory: Arc<dyn BucketFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Clock for the factory built from [`LimiterBuilder::bucket`].
    pub fn clock(mut self, clock: ClockSource) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Leak interval for the factory built from [`LimiterBuilder::bucket`].
    pub fn leak_interval(mut self, interval: Duration) -> Self {
        self.leak_interval = Some(interval);
        self
    }

    pub fn raise_when_fail(mut self, raise: bool) -> Self {
        self.policy.raise_when_fail = raise;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.policy.max_delay = Some(max_delay);
        self
    }

    pub fn retry_until_max_delay(mut self, retry: bool) -> Self {
        self.policy.retry_until_max_delay = retry;
        self
    }

    pub fn buffer(mut self, buffer: Duration) -> Self {
        self.policy.buffer = buffer;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    /// Apply the policies and leak interval from `config` (its rates are ignored here).
    pub fn config(mut self, config: &LimiterConfig) -> Self {
        self.policy = Policy {
            raise_when_fail: config.raise_when_fail,
            max_delay: config.max_delay(),
            retry_until_max_delay: config.retry_until_max_delay,
            buffer: config.buffer(),
        };
        self.leak_interval = Some(config.leak_interval());
        self
    }

    pub fn build(self) -> Result<Limiter, LimiterError> {
        if self.leak_interval == Some(Duration::ZERO) {
            return Err(LimiterError::invalid("leak interval must be > 0"));
        }
        let (factory, owns_factory): (Arc<dyn BucketFactory>, bool) = match (self.factory, self.bucket) {
            (Some(_), Some(_)) => {
                return Err(LimiterError::invalid("configure either a bucket or a factory, not both"))
            }
            (Some(factory), None) => (factory, false),
            (None, Some(bucket)) => {
                let mut builder = DefaultBucketFactory::builder().default_bucket(bucket);
                if let Some(clock) = self.clock {
                    builder = builder.clock(clock);
                }
                if let Some(interval) = self.leak_interval {
                    builder = builder.leak_interval(interval);
                }
                (Arc::new(builder.build()?), true)
            }
            (None, None) => return Err(LimiterError::invalid("limiter needs a bucket or a bucket factory")),
        };
        Ok(Limiter {
            factory,
            owns_factory,
            closed: AtomicBool::new(false),
            policy: self.policy,
            lock: Arc::new(ProcessLock::new()),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(SystemSleeper)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::sleeper::{AdvancingSleeper, TrackingSleeper};

    fn rate(limit: u64, interval: i64) -> Rate {
        Rate::new(limit, interval).unwrap()
    }

    fn manual_limiter(rates: Vec<Rate>, clock: &ManualClock, policy: impl FnOnce(LimiterBuilder) -> LimiterBuilder) -> Limiter {
        let bucket = Arc::new(InMemoryBucket::new(rates).unwrap());
        policy(
            Limiter::builder()
                .bucket(bucket)
                .clock(ClockSource::sync(clock.clone()))
                .leak_interval(Duration::from_secs(3_600))
                .with_sleeper(AdvancingSleeper::new(clock.clone())),
        )
        .build()
        .unwrap()
    }

    fn attempt(policy: Policy, options: AcquireOptions, now: Instant) -> Attempt<'static> {
        Attempt::new("a", 1, policy, options, now)
    }

    #[test]
    fn attempt_rejects_non_blocking_and_zero_delay() {
        let now = Instant::now();
        let mut a = attempt(Policy::default(), AcquireOptions::non_blocking(), now);
        assert!(matches!(a.on_denied(Duration::from_millis(10), None, now), Step::Reject(e) if e.is_bucket_full()));

        let zero = Policy { max_delay: Some(Duration::ZERO), ..Policy::default() };
        let mut a = attempt(zero, AcquireOptions::blocking(), now);
        assert!(matches!(a.on_denied(Duration::from_millis(10), None, now), Step::Reject(e) if e.is_bucket_full()));
    }

    #[test]
    fn attempt_retries_once_unless_told_otherwise() {
        let now = Instant::now();
        let mut a = attempt(Policy::default(), AcquireOptions::blocking(), now);
        assert!(matches!(a.on_denied(Duration::from_millis(10), None, now), Step::Sleep(d) if d == Duration::from_millis(10)));
        assert!(matches!(a.on_denied(Duration::from_millis(10), None, now), Step::Reject(e) if e.is_bucket_full()));

        let policy = Policy { retry_until_max_delay: true, max_delay: Some(Duration::from_millis(25)), ..Policy::default() };
        let mut a = attempt(policy, AcquireOptions::blocking(), now);
        assert!(matches!(a.on_denied(Duration::from_millis(10), None, now), Step::Sleep(_)));
        assert!(matches!(a.on_denied(Duration::from_millis(10), None, now), Step::Sleep(_)));
        match a.on_denied(Duration::from_millis(10), None, now) {
            Step::Reject(e) => assert_eq!(e.delay_details(), Some((30, 25))),
            other => panic!("expected delay rejection, got {:?}", other),
        }
    }

    #[test]
    fn attempt_truncates_to_deadline() {
        let now = Instant::now();
        let options = AcquireOptions::blocking().with_timeout(Duration::from_millis(100));
        let mut a = attempt(Policy::default(), options, now);
        match a.on_denied(Duration::from_millis(250), None, now + Duration::from_millis(20)) {
            Step::Expire(rest) => assert_eq!(rest, Duration::from_millis(80)),
            other => panic!("expected expiry, got {:?}", other),
        }
    }

    #[test]
    fn blocking_acquire_waits_for_the_window() {
        let clock = ManualClock::new(10_000);
        let limiter = manual_limiter(vec![rate(1, 200)], &clock, |b| b.buffer(Duration::ZERO));

        assert!(limiter.try_acquire("a", 1).unwrap());
        assert!(limiter.try_acquire("a", 1).unwrap());
        assert_eq!(clock.now_millis(), 10_200);
    }

    #[test]
    fn buffer_is_added_to_every_wait() {
        let clock = ManualClock::new(0);
        let sleeper = TrackingSleeper::new();
        let bucket = Arc::new(InMemoryBucket::new(vec![rate(1, 200)]).unwrap());
        let limiter = Limiter::builder()
            .bucket(bucket)
            .clock(ClockSource::sync(clock.clone()))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();

        assert!(limiter.try_acquire("a", 1).unwrap());
        // the clock never moves, so the single retry fails too
        assert!(!limiter.try_acquire("a", 1).unwrap());
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(250)]);
    }

    #[test]
    fn non_blocking_refusal_respects_raise_policy() {
        let clock = ManualClock::new(0);
        let quiet = manual_limiter(vec![rate(1, 200)], &clock, |b| b);
        assert!(quiet.try_acquire_with("a", 1, AcquireOptions::non_blocking()).unwrap());
        assert!(!quiet.try_acquire_with("a", 1, AcquireOptions::non_blocking()).unwrap());

        let loud = manual_limiter(vec![rate(1, 200)], &clock, |b| b.raise_when_fail(true));
        assert!(loud.try_acquire_with("a", 1, AcquireOptions::non_blocking()).unwrap());
        let err = loud.try_acquire_with("a", 1, AcquireOptions::non_blocking()).unwrap_err();
        assert!(err.is_bucket_full());
        assert_eq!(err.item_name(), Some("a"));
    }

    #[test]
    fn max_delay_raises_delay_error() {
        let clock = ManualClock::new(0);
        let limiter = manual_limiter(vec![rate(1, 1_000)], &clock, |b| {
            b.raise_when_fail(true).max_delay(Duration::from_millis(500))
        });
        assert!(limiter.try_acquire("a", 1).unwrap());
        let err = limiter.try_acquire("a", 1).unwrap_err();
        assert_eq!(err.delay_details(), Some((1_050, 500)));
    }

    #[test]
    fn weight_beyond_capacity_is_always_an_error() {
        let clock = ManualClock::new(0);
        let limiter = manual_limiter(vec![rate(3, 1_000), rate(10, 60_000)], &clock, |b| b);
        let err = limiter.try_acquire("a", 4).unwrap_err();
        assert!(err.is_weight_exceeded());
        assert!(limiter.try_acquire("a", 0).unwrap_err().is_invalid_config());
    }

    #[test]
    fn maximal_weight_is_refused_as_capacity_error() {
        let clock = ManualClock::new(0);
        let bucket = Arc::new(InMemoryBucket::new(vec![rate(10, 1_000)]).unwrap());
        let limiter = Limiter::builder()
            .bucket(bucket.clone())
            .clock(ClockSource::sync(clock.clone()))
            .with_sleeper(AdvancingSleeper::new(clock))
            .build()
            .unwrap();
        assert!(limiter.try_acquire("a", 1).unwrap());

        let err = limiter.try_acquire_with("a", u64::MAX, AcquireOptions::non_blocking()).unwrap_err();
        assert!(err.is_weight_exceeded());
        assert_eq!(bucket.count().unwrap(), 1);
        // the bucket stays usable afterwards
        assert!(limiter.try_acquire_with("a", 1, AcquireOptions::non_blocking()).unwrap());
    }

    #[test]
    fn retry_until_max_delay_keeps_going() {
        let clock = ManualClock::new(0);
        let limiter = manual_limiter(vec![rate(2, 100), rate(3, 1_000)], &clock, |b| {
            b.retry_until_max_delay(true).buffer(Duration::ZERO)
        });
        for _ in 0..3 {
            assert!(limiter.try_acquire("a", 1).unwrap());
        }
        assert_eq!(clock.now_millis(), 100);
        assert!(limiter.try_acquire("a", 1).unwrap());
        assert_eq!(clock.now_millis(), 1_000);
    }

    #[tokio::test]
    async fn async_face_matches_sync_face() {
        let clock = ManualClock::new(0);
        let limiter = manual_limiter(vec![rate(1, 200)], &clock, |b| b.buffer(Duration::ZERO));
        assert!(limiter.try_acquire_async("a", 1).await.unwrap());
        assert!(!limiter.try_acquire_async_with("a", 1, AcquireOptions::non_blocking()).await.unwrap());
        assert!(limiter.try_acquire_async("a", 1).await.unwrap());
        assert_eq!(clock.now_millis(), 200);
    }

    #[tokio::test]
    async fn cancelled_acquisition_releases_locks_and_leaves_bucket_untouched() {
        let clock = ManualClock::new(0);
        let bucket = Arc::new(InMemoryBucket::new(vec![rate(1, 60_000)]).unwrap());
        let limiter = Limiter::builder()
            .bucket(bucket.clone())
            .clock(ClockSource::sync(clock.clone()))
            .leak_interval(Duration::from_secs(3_600))
            .buffer(Duration::ZERO)
            .build()
            .unwrap();
        assert!(limiter.try_acquire_async("a", 1).await.unwrap());

        // suspended in a 60s wait while holding the lock set
        let blocked = tokio::time::timeout(Duration::from_millis(50), limiter.try_acquire_async("a", 1)).await;
        assert!(blocked.is_err());
        assert_eq!(bucket.count().unwrap(), 1);

        clock.advance(60_000);
        let options = AcquireOptions::blocking().with_timeout(Duration::from_millis(10));
        assert!(limiter.try_acquire_with("a", 1, options).unwrap());
        assert_eq!(bucket.count().unwrap(), 2);
    }

    #[test]
    fn builder_requires_a_source() {
        assert!(Limiter::builder().build().unwrap_err().is_invalid_config());
        let factory: Arc<dyn BucketFactory> =
            Arc::new(DefaultBucketFactory::single(Arc::new(InMemoryBucket::new(vec![rate(1, 10)]).unwrap())).unwrap());
        let both = Limiter::builder()
            .factory(factory)
            .bucket(Arc::new(InMemoryBucket::new(vec![rate(1, 10)]).unwrap()))
            .build();
        assert!(both.is_err());
    }

    #[test]
    fn zero_leak_interval_is_rejected() {
        let bucket = || Arc::new(InMemoryBucket::new(vec![rate(1, 10)]).unwrap());
        let err = Limiter::builder().bucket(bucket()).leak_interval(Duration::ZERO).build().unwrap_err();
        assert!(err.is_invalid_config());

        let config = LimiterConfig { leak_interval_ms: 0, ..LimiterConfig::default() };
        let err = Limiter::builder().bucket(bucket()).config(&config).build().unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[test]
    fn close_only_closes_owned_factories() {
        let shared: Arc<dyn BucketFactory> =
            Arc::new(DefaultBucketFactory::single(Arc::new(InMemoryBucket::new(vec![rate(5, 10)]).unwrap())).unwrap());
        let borrowed = Limiter::builder().factory(shared.clone()).build().unwrap();
        borrowed.close().unwrap();
        assert!(shared.wrap_item("a", 1).is_ok());
        assert!(borrowed.try_acquire("a", 1).unwrap_err().is_invalid_config());

        let owned = Limiter::new(Arc::new(InMemoryBucket::new(vec![rate(5, 10)]).unwrap())).unwrap();
        owned.close().unwrap();
        assert!(owned.factory().wrap_item("a", 1).is_err());
    }
}
