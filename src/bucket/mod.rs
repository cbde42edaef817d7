//! Bucket contract shared by every storage backend.
//!
//! A bucket is an ordered log of admitted [`RateItem`]s governed by a validated list of
//! [`Rate`]s. Synchronous backends implement [`Bucket`], remote backends implement
//! [`AsyncBucket`], and [`BucketHandle`] lets the limiter hold either.

mod in_memory;
mod log;
mod multiprocess;

pub use in_memory::InMemoryBucket;
pub use log::SlidingLog;
pub use multiprocess::MultiprocessBucket;

use crate::lock::TimedLock;
use crate::rate::{Rate, RateItem};
use crate::LimiterError;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique bucket identity, stable for the bucket's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(u64);

impl BucketId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bucket#{}", self.0)
    }
}

/// Compute the wait for `item` from the failing rate and the item it points at.
///
/// `-1` means the weight can never fit the failing rate.
pub fn waiting_from(failing: Option<Rate>, item: &RateItem, bound: Option<&RateItem>) -> i64 {
    let Some(rate) = failing else {
        return 0;
    };
    if item.weight() > rate.limit() {
        return -1;
    }
    match bound {
        Some(bound) => (bound.timestamp() - (item.timestamp() - rate.interval())).max(0),
        None => 0,
    }
}

/// Index (counted from newest) of the item whose expiry frees room for `item`.
pub fn waiting_index(failing: Option<Rate>, item: &RateItem) -> Option<u64> {
    failing.and_then(|rate| rate.limit().checked_sub(item.weight()))
}

/// Synchronous bucket.
pub trait Bucket: Send + Sync + fmt::Debug {
    fn id(&self) -> BucketId;

    /// Rates in ascending order.
    fn rates(&self) -> &[Rate];

    /// Insert `item.weight()` copies of the item if every rate allows it.
    ///
    /// On rejection the first violated rate becomes [`Bucket::failing_rate`]; on success it is
    /// cleared.
    fn put(&self, item: &RateItem) -> Result<bool, LimiterError>;

    /// Items currently stored, including expired ones not yet leaked.
    fn count(&self) -> Result<u64, LimiterError>;

    /// Item at `index` counted from the newest (0 = most recent).
    fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError>;

    /// Remove items with `timestamp <= now - max_interval`; returns how many were removed.
    fn leak(&self, now: i64) -> Result<u64, LimiterError>;

    /// Remove everything and clear the failing rate.
    fn flush(&self) -> Result<(), LimiterError>;

    fn failing_rate(&self) -> Option<Rate>;

    /// Milliseconds until an equivalent `put` would pass the failing rate; `-1` if never.
    fn waiting(&self, item: &RateItem) -> Result<i64, LimiterError> {
        let failing = self.failing_rate();
        let bound = match waiting_index(failing, item) {
            Some(index) => self.peek(index)?,
            None => None,
        };
        Ok(waiting_from(failing, item, bound.as_ref()))
    }

    /// Cross-process lock the limiter must hold in front of its own lock.
    fn limiter_lock(&self) -> Option<Arc<dyn TimedLock>> {
        None
    }

    /// Release backend resources. Idempotent.
    fn close(&self) -> Result<(), LimiterError> {
        Ok(())
    }
}

/// Asynchronous bucket; same contract as [`Bucket`].
#[async_trait]
pub trait AsyncBucket: Send + Sync + fmt::Debug {
    fn id(&self) -> BucketId;

    fn rates(&self) -> &[Rate];

    async fn put(&self, item: &RateItem) -> Result<bool, LimiterError>;

    async fn count(&self) -> Result<u64, LimiterError>;

    async fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError>;

    async fn leak(&self, now: i64) -> Result<u64, LimiterError>;

    async fn flush(&self) -> Result<(), LimiterError>;

    fn failing_rate(&self) -> Option<Rate>;

    async fn waiting(&self, item: &RateItem) -> Result<i64, LimiterError> {
        let failing = self.failing_rate();
        let bound = match waiting_index(failing, item) {
            Some(index) => self.peek(index).await?,
            None => None,
        };
        Ok(waiting_from(failing, item, bound.as_ref()))
    }

    fn limiter_lock(&self) -> Option<Arc<dyn TimedLock>> {
        None
    }

    async fn close(&self) -> Result<(), LimiterError> {
        Ok(())
    }
}

/// Presents a synchronous bucket through [`AsyncBucket`].
#[derive(Debug, Clone)]
pub struct SyncBucketAdapter {
    inner: Arc<dyn Bucket>,
}

impl SyncBucketAdapter {
    pub fn new(inner: Arc<dyn Bucket>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn Bucket> {
        &self.inner
    }
}

#[async_trait]
impl AsyncBucket for SyncBucketAdapter {
    fn id(&self) -> BucketId {
        self.inner.id()
    }

    fn rates(&self) -> &[Rate] {
        self.inner.rates()
    }

    async fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        self.inner.put(item)
    }

    async fn count(&self) -> Result<u64, LimiterError> {
        self.inner.count()
    }

    async fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        self.inner.peek(index)
    }

    async fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        self.inner.leak(now)
    }

    async fn flush(&self) -> Result<(), LimiterError> {
        self.inner.flush()
    }

    fn failing_rate(&self) -> Option<Rate> {
        self.inner.failing_rate()
    }

    async fn waiting(&self, item: &RateItem) -> Result<i64, LimiterError> {
        self.inner.waiting(item)
    }

    fn limiter_lock(&self) -> Option<Arc<dyn TimedLock>> {
        self.inner.limiter_lock()
    }

    async fn close(&self) -> Result<(), LimiterError> {
        self.inner.close()
    }
}

/// A bucket of either kind, as held by factories and the limiter.
#[derive(Debug, Clone)]
pub enum BucketHandle {
    Sync(Arc<dyn Bucket>),
    Async(Arc<dyn AsyncBucket>),
}

impl BucketHandle {
    pub fn sync<B: Bucket + 'static>(bucket: B) -> Self {
        Self::Sync(Arc::new(bucket))
    }

    pub fn asynchronous<B: AsyncBucket + 'static>(bucket: B) -> Self {
        Self::Async(Arc::new(bucket))
    }

    pub fn id(&self) -> BucketId {
        match self {
            Self::Sync(b) => b.id(),
            Self::Async(b) => b.id(),
        }
    }

    pub fn rates(&self) -> &[Rate] {
        match self {
            Self::Sync(b) => b.rates(),
            Self::Async(b) => b.rates(),
        }
    }

    pub fn failing_rate(&self) -> Option<Rate> {
        match self {
            Self::Sync(b) => b.failing_rate(),
            Self::Async(b) => b.failing_rate(),
        }
    }

    pub fn limiter_lock(&self) -> Option<Arc<dyn TimedLock>> {
        match self {
            Self::Sync(b) => b.limiter_lock(),
            Self::Async(b) => b.limiter_lock(),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    pub fn as_sync(&self) -> Option<&Arc<dyn Bucket>> {
        match self {
            Self::Sync(b) => Some(b),
            Self::Async(_) => None,
        }
    }

    /// View this bucket through the async interface.
    pub fn to_async(&self) -> Arc<dyn AsyncBucket> {
        match self {
            Self::Sync(b) => Arc::new(SyncBucketAdapter::new(b.clone())),
            Self::Async(b) => b.clone(),
        }
    }

    pub async fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        match self {
            Self::Sync(b) => b.put(item),
            Self::Async(b) => b.put(item).await,
        }
    }

    pub async fn count(&self) -> Result<u64, LimiterError> {
        match self {
            Self::Sync(b) => b.count(),
            Self::Async(b) => b.count().await,
        }
    }

    pub async fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        match self {
            Self::Sync(b) => b.peek(index),
            Self::Async(b) => b.peek(index).await,
        }
    }

    pub async fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        match self {
            Self::Sync(b) => b.leak(now),
            Self::Async(b) => b.leak(now).await,
        }
    }

    pub async fn flush(&self) -> Result<(), LimiterError> {
        match self {
            Self::Sync(b) => b.flush(),
            Self::Async(b) => b.flush().await,
        }
    }

    pub async fn waiting(&self, item: &RateItem) -> Result<i64, LimiterError> {
        match self {
            Self::Sync(b) => b.waiting(item),
            Self::Async(b) => b.waiting(item).await,
        }
    }

    pub async fn close(&self) -> Result<(), LimiterError> {
        match self {
            Self::Sync(b) => b.close(),
            Self::Async(b) => b.close().await,
        }
    }
}

impl<B: Bucket + 'static> From<Arc<B>> for BucketHandle {
    fn from(bucket: Arc<B>) -> Self {
        Self::Sync(bucket)
    }
}
