//! Resolving item names to buckets.
//!
//! A factory owns its buckets, stamps items with its clock and keeps its buckets registered
//! with a [`Leaker`].

use crate::bucket::{BucketHandle, BucketId};
use crate::clock::ClockSource;
use crate::leaker::{Leaker, DEFAULT_LEAK_INTERVAL};
use crate::lock::TimedLock;
use crate::rate::RateItem;
use crate::LimiterError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Maps items to buckets for a limiter.
#[async_trait]
pub trait BucketFactory: Send + Sync + fmt::Debug {
    /// Stamp a new item with the factory clock.
    fn wrap_item(&self, name: &str, weight: u64) -> Result<RateItem, LimiterError>;

    async fn wrap_item_async(&self, name: &str, weight: u64) -> Result<RateItem, LimiterError> {
        self.wrap_item(name, weight)
    }

    /// Bucket that serves `item`; may create one on demand.
    fn get(&self, item: &RateItem) -> Result<BucketHandle, LimiterError>;

    /// Cross-process locks the limiter must take before its own.
    fn limiter_locks(&self) -> Vec<Arc<dyn TimedLock>> {
        Vec::new()
    }

    /// Deregister and drop `bucket`. Returns whether the factory owned it.
    fn dispose(&self, bucket: &BucketHandle) -> bool;

    /// Deregister and close every bucket. Idempotent.
    fn close(&self) -> Result<(), LimiterError>;

    /// Like [`BucketFactory::close`] but awaits async buckets' `close`.
    async fn close_async(&self) -> Result<(), LimiterError> {
        self.close()
    }
}

/// Builds a bucket for a name that has no explicit route.
pub type BucketTemplate = Arc<dyn Fn(&str) -> Result<BucketHandle, LimiterError> + Send + Sync>;

#[derive(Default)]
struct Routes {
    named: HashMap<String, BucketHandle>,
    fallback: Option<BucketHandle>,
}

impl Routes {
    fn drain(&mut self) -> Vec<BucketHandle> {
        let mut all: Vec<BucketHandle> = self.named.drain().map(|(_, b)| b).collect();
        all.extend(self.fallback.take());
        dedup(all)
    }

    fn handles(&self) -> Vec<BucketHandle> {
        dedup(self.named.values().cloned().chain(self.fallback.clone()).collect())
    }
}

fn dedup(handles: Vec<BucketHandle>) -> Vec<BucketHandle> {
    let mut seen = Vec::new();
    handles
        .into_iter()
        .filter(|h| {
            let id = h.id();
            if seen.contains(&id) {
                false
            } else {
                seen.push(id);
                true
            }
        })
        .collect()
}

/// Routes exact names first, then the default bucket, then the per-name template.
pub struct DefaultBucketFactory {
    clock: ClockSource,
    leaker: Leaker,
    routes: RwLock<Routes>,
    template: Option<BucketTemplate>,
    closed: AtomicBool,
}

impl fmt::Debug for DefaultBucketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes();
        f.debug_struct("DefaultBucketFactory")
            .field("clock", &self.clock)
            .field("routes", &routes.named.keys().collect::<Vec<_>>())
            .field("has_default", &routes.fallback.is_some())
            .field("has_template", &self.template.is_some())
            .field("leaker", &self.leaker)
            .finish()
    }
}

impl DefaultBucketFactory {
    pub fn builder() -> DefaultBucketFactoryBuilder {
        DefaultBucketFactoryBuilder::default()
    }

    /// Route every name to `bucket`, stamped by a [`crate::SystemClock`].
    pub fn single(bucket: impl Into<BucketHandle>) -> Result<Self, LimiterError> {
        Self::builder().default_bucket(bucket).build()
    }

    pub fn clock(&self) -> &ClockSource {
        &self.clock
    }

    pub fn leaker(&self) -> &Leaker {
        &self.leaker
    }

    fn routes(&self) -> RwLockReadGuard<'_, Routes> {
        self.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn routes_mut(&self) -> RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a freshly built bucket with the leaker and hand it back.
    pub fn create(&self, bucket: BucketHandle) -> BucketHandle {
        self.leaker.register(&bucket, &self.clock);
        debug!(target: "ratewindow::factory", bucket = %bucket.id(), "bucket created");
        bucket
    }

    /// Route `name` to `bucket`, replacing any previous route.
    pub fn route(&self, name: impl Into<String>, bucket: BucketHandle) {
        let name = name.into();
        let bucket = self.create(bucket);
        let previous = self.routes_mut().named.insert(name.clone(), bucket);
        if let Some(previous) = previous {
            warn!(target: "ratewindow::factory", name = %name, "route replaced; last registration wins");
            self.forget_if_unrouted(previous.id());
        }
    }

    /// Every bucket currently owned, without duplicates.
    pub fn buckets(&self) -> Vec<BucketHandle> {
        self.routes().handles()
    }

    fn forget_if_unrouted(&self, id: BucketId) {
        if !self.routes().handles().iter().any(|b| b.id() == id) {
            self.leaker.deregister(id);
        }
    }

    fn stamp(&self, name: &str, weight: u64, now: i64) -> Result<RateItem, LimiterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LimiterError::invalid("bucket factory is closed"));
        }
        RateItem::new(name, now, weight)
    }

    fn close_routes(&self) -> Option<Vec<BucketHandle>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.leaker.deregister_all();
        Some(self.routes_mut().drain())
    }
}

#[async_trait]
impl BucketFactory for DefaultBucketFactory {
    fn wrap_item(&self, name: &str, weight: u64) -> Result<RateItem, LimiterError> {
        let now = self.clock.now_blocking().ok_or_else(|| {
            LimiterError::invalid("factory clock is async; use the async acquisition path")
        })?;
        self.stamp(name, weight, now)
    }

    async fn wrap_item_async(&self, name: &str, weight: u64) -> Result<RateItem, LimiterError> {
        let now = self.clock.now().await;
        self.stamp(name, weight, now)
    }

    fn get(&self, item: &RateItem) -> Result<BucketHandle, LimiterError> {
        {
            let routes = self.routes();
            if let Some(bucket) = routes.named.get(item.name()).or(routes.fallback.as_ref()) {
                return Ok(bucket.clone());
            }
        }
        let Some(template) = &self.template else {
            return Err(LimiterError::invalid(format!("no bucket routes '{}'", item.name())));
        };

        let mut routes = self.routes_mut();
        if let Some(bucket) = routes.named.get(item.name()) {
            return Ok(bucket.clone());
        }
        let bucket = self.create((**template)(item.name())?);
        routes.named.insert(item.name().to_string(), bucket.clone());
        Ok(bucket)
    }

    fn limiter_locks(&self) -> Vec<Arc<dyn TimedLock>> {
        let mut locks: Vec<Arc<dyn TimedLock>> = Vec::new();
        for lock in self.buckets().iter().filter_map(BucketHandle::limiter_lock) {
            let ptr = Arc::as_ptr(&lock) as *const ();
            if !locks.iter().any(|l| Arc::as_ptr(l) as *const () == ptr) {
                locks.push(lock);
            }
        }
        locks
    }

    fn dispose(&self, bucket: &BucketHandle) -> bool {
        let id = bucket.id();
        let found = {
            let mut routes = self.routes_mut();
            let before = routes.named.len();
            routes.named.retain(|_, b| b.id() != id);
            let mut found = routes.named.len() != before;
            if routes.fallback.as_ref().is_some_and(|b| b.id() == id) {
                routes.fallback = None;
                found = true;
            }
            found
        };
        self.leaker.deregister(id);
        if found {
            if let Some(sync) = bucket.as_sync() {
                if let Err(err) = sync.close() {
                    warn!(target: "ratewindow::factory", bucket = %id, error = %err, "bucket close failed");
                }
            }
        }
        found
    }

    fn close(&self) -> Result<(), LimiterError> {
        let Some(buckets) = self.close_routes() else {
            return Ok(());
        };
        let mut first_err = None;
        for bucket in buckets {
            if let Some(sync) = bucket.as_sync() {
                if let Err(err) = sync.close() {
                    warn!(target: "ratewindow::factory", bucket = %bucket.id(), error = %err, "bucket close failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn close_async(&self) -> Result<(), LimiterError> {
        let Some(buckets) = self.close_routes() else {
            return Ok(());
        };
        let mut first_err = None;
        for bucket in buckets {
            if let Err(err) = bucket.close().await {
                warn!(target: "ratewindow::factory", bucket = %bucket.id(), error = %err, "bucket close failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for DefaultBucketFactory {
    fn drop(&mut self) {
        if let Err(err) = BucketFactory::close(self) {
            warn!(target: "ratewindow::factory", error = %err, "closing bucket factory failed");
        }
    }
}

/// Builder for [`DefaultBucketFactory`].
#[derive(Default)]
pub struct DefaultBucketFactoryBuilder {
    clock: Option<ClockSource>,
    leak_interval: Option<Duration>,
    named: Vec<(String, BucketHandle)>,
    fallback: Option<BucketHandle>,
    template: Option<BucketTemplate>,
}

impl DefaultBucketFactoryBuilder {
    /// Clock used to stamp items and drive leaks. Defaults to [`crate::SystemClock`].
    pub fn clock(mut self, clock: ClockSource) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Pause between background leak passes (default 10s).
    pub fn leak_interval(mut self, interval: Duration) -> Self {
        self.leak_interval = Some(interval);
        self
    }

    pub fn route(mut self, name: impl Into<String>, bucket: impl Into<BucketHandle>) -> Self {
        self.named.push((name.into(), bucket.into()));
        self
    }

    pub fn default_bucket(mut self, bucket: impl Into<BucketHandle>) -> Self {
        self.fallback = Some(bucket.into());
        self
    }

    /// Create a dedicated bucket the first time an unrouted name is seen.
    pub fn per_name<F>(mut self, template: F) -> Self
    where
        F: Fn(&str) -> Result<BucketHandle, LimiterError> + Send + Sync + 'static,
    {
        self.template = Some(Arc::new(template));
        self
    }

    pub fn build(self) -> Result<DefaultBucketFactory, LimiterError> {
        if self.leak_interval == Some(Duration::ZERO) {
            return Err(LimiterError::invalid("leak interval must be > 0"));
        }
        if self.named.is_empty() && self.fallback.is_none() && self.template.is_none() {
            return Err(LimiterError::invalid("bucket factory needs at least one bucket or a template"));
        }
        let factory = DefaultBucketFactory {
            clock: self.clock.unwrap_or_default(),
            leaker: Leaker::new(self.leak_interval.unwrap_or(DEFAULT_LEAK_INTERVAL)),
            routes: RwLock::new(Routes::default()),
            template: self.template,
            closed: AtomicBool::new(false),
        };
        if let Some(fallback) = self.fallback {
            let fallback = factory.create(fallback);
            factory.routes_mut().fallback = Some(fallback);
        }
        for (name, bucket) in self.named {
            factory.route(name, bucket);
        }
        Ok(factory)
    }
}
