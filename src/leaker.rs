//! Background eviction of expired items.
//!
//! Each factory owns one `Leaker`. Buckets read through a synchronous clock are leaked by a
//! dedicated worker thread; everything else (async buckets, async clocks) is leaked by a task on
//! the tokio runtime that was current at the first such registration. Registrations hold weak
//! references only, so a leaker never keeps a bucket alive.

use crate::bucket::{AsyncBucket, Bucket, BucketHandle, BucketId};
use crate::clock::{Clock, ClockSource};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default pause between leak passes.
pub const DEFAULT_LEAK_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest pause between leak passes; shorter intervals are raised to it.
pub const MIN_LEAK_INTERVAL: Duration = Duration::from_millis(1);

struct SyncEntry {
    bucket: Weak<dyn Bucket>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
enum AsyncTarget {
    Sync(Weak<dyn Bucket>),
    Async(Weak<dyn AsyncBucket>),
}

#[derive(Clone)]
struct AsyncEntry {
    target: AsyncTarget,
    clock: ClockSource,
}

#[derive(Default)]
struct SyncRegistry {
    entries: HashMap<BucketId, SyncEntry>,
    worker_running: bool,
    shutdown: bool,
}

#[derive(Default)]
struct AsyncRegistry {
    entries: HashMap<BucketId, AsyncEntry>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    interval: Duration,
    sync: Mutex<SyncRegistry>,
    wake: Condvar,
    tasks: Mutex<AsyncRegistry>,
}

impl Shared {
    fn sync(&self) -> MutexGuard<'_, SyncRegistry> {
        self.sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, AsyncRegistry> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn leak_sync(&self) -> u64 {
        let snapshot: Vec<(BucketId, Weak<dyn Bucket>, Arc<dyn Clock>)> =
            self.sync().entries.iter().map(|(id, e)| (*id, e.bucket.clone(), e.clock.clone())).collect();

        let mut removed = 0;
        let mut dead = Vec::new();
        for (id, bucket, clock) in snapshot {
            let Some(bucket) = bucket.upgrade() else {
                dead.push(id);
                continue;
            };
            match bucket.leak(clock.now_millis()) {
                Ok(n) => {
                    if n > 0 {
                        debug!(target: "ratewindow::leaker", bucket = %id, removed = n, "leaked expired items");
                    }
                    removed += n;
                }
                Err(err) => warn!(target: "ratewindow::leaker", bucket = %id, error = %err, "leak failed"),
            }
        }
        if !dead.is_empty() {
            let mut registry = self.sync();
            for id in dead {
                registry.entries.remove(&id);
            }
        }
        removed
    }

    async fn leak_async(&self) -> u64 {
        let snapshot: Vec<(BucketId, AsyncEntry)> =
            self.tasks().entries.iter().map(|(id, e)| (*id, e.clone())).collect();

        let mut removed = 0;
        let mut dead = Vec::new();
        for (id, entry) in snapshot {
            let bucket = match &entry.target {
                AsyncTarget::Sync(weak) => weak.upgrade().map(BucketHandle::Sync),
                AsyncTarget::Async(weak) => weak.upgrade().map(BucketHandle::Async),
            };
            let Some(bucket) = bucket else {
                dead.push(id);
                continue;
            };
            let now = entry.clock.now().await;
            match bucket.leak(now).await {
                Ok(n) => {
                    if n > 0 {
                        debug!(target: "ratewindow::leaker", bucket = %id, removed = n, "leaked expired items");
                    }
                    removed += n;
                }
                Err(err) => warn!(target: "ratewindow::leaker", bucket = %id, error = %err, "leak failed"),
            }
        }
        if !dead.is_empty() {
            let mut registry = self.tasks();
            for id in dead {
                registry.entries.remove(&id);
            }
        }
        removed
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        shared.leak_sync();

        let deadline = Instant::now() + shared.interval;
        let mut registry = shared.sync();
        loop {
            if registry.shutdown || registry.entries.is_empty() {
                registry.worker_running = false;
                debug!(target: "ratewindow::leaker", "sync leak worker exiting");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            registry = shared
                .wake
                .wait_timeout(registry, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

/// Periodically evicts expired items from registered buckets.
pub struct Leaker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Leaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leaker")
            .field("interval", &self.shared.interval)
            .field("sync", &self.sync_len())
            .field("async", &self.async_len())
            .finish()
    }
}

impl Default for Leaker {
    fn default() -> Self {
        Self::new(DEFAULT_LEAK_INTERVAL)
    }
}

impl Leaker {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval: interval.max(MIN_LEAK_INTERVAL),
                sync: Mutex::new(SyncRegistry::default()),
                wake: Condvar::new(),
                tasks: Mutex::new(AsyncRegistry::default()),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Register `bucket` to be leaked with readings from `clock`. Re-registering an id replaces
    /// the previous entry.
    pub fn register(&self, bucket: &BucketHandle, clock: &ClockSource) {
        let id = bucket.id();
        match (bucket, clock) {
            (BucketHandle::Sync(bucket), ClockSource::Sync(clock)) => {
                self.register_sync(id, SyncEntry { bucket: Arc::downgrade(bucket), clock: clock.clone() })
            }
            (BucketHandle::Sync(bucket), clock) => self.register_async(
                id,
                AsyncEntry { target: AsyncTarget::Sync(Arc::downgrade(bucket)), clock: clock.clone() },
            ),
            (BucketHandle::Async(bucket), clock) => self.register_async(
                id,
                AsyncEntry { target: AsyncTarget::Async(Arc::downgrade(bucket)), clock: clock.clone() },
            ),
        }
    }

    fn register_sync(&self, id: BucketId, entry: SyncEntry) {
        let mut registry = self.shared.sync();
        if registry.entries.insert(id, entry).is_some() {
            warn!(target: "ratewindow::leaker", bucket = %id, "bucket registered twice; replacing entry");
        }
        registry.shutdown = false;
        if registry.worker_running {
            return;
        }
        let shared = self.shared.clone();
        match std::thread::Builder::new().name("ratewindow-leaker".into()).spawn(move || run_worker(shared)) {
            Ok(_) => registry.worker_running = true,
            Err(err) => warn!(target: "ratewindow::leaker", error = %err, "could not start leak worker"),
        }
    }

    fn register_async(&self, id: BucketId, entry: AsyncEntry) {
        let mut registry = self.shared.tasks();
        if registry.entries.insert(id, entry).is_some() {
            warn!(target: "ratewindow::leaker", bucket = %id, "bucket registered twice; replacing entry");
        }
        if registry.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(target: "ratewindow::leaker", bucket = %id, "no tokio runtime; async bucket will not be leaked in the background");
                return;
            }
        };
        let shared = self.shared.clone();
        registry.task = Some(runtime.spawn(async move {
            loop {
                shared.leak_async().await;
                if shared.tasks().entries.is_empty() {
                    break;
                }
                tokio::time::sleep(shared.interval).await;
            }
        }));
    }

    /// Remove a registration. Returns whether the bucket was registered.
    pub fn deregister(&self, id: BucketId) -> bool {
        let in_sync = {
            let mut registry = self.shared.sync();
            let found = registry.entries.remove(&id).is_some();
            if found && registry.entries.is_empty() {
                self.shared.wake.notify_all();
            }
            found
        };
        let in_async = {
            let mut registry = self.shared.tasks();
            let found = registry.entries.remove(&id).is_some();
            if found && registry.entries.is_empty() {
                if let Some(task) = registry.task.take() {
                    task.abort();
                }
            }
            found
        };
        in_sync || in_async
    }

    /// Drop every registration and stop the background work.
    pub fn deregister_all(&self) {
        {
            let mut registry = self.shared.sync();
            registry.entries.clear();
            registry.shutdown = true;
        }
        self.shared.wake.notify_all();

        let mut registry = self.shared.tasks();
        registry.entries.clear();
        if let Some(task) = registry.task.take() {
            task.abort();
        }
    }

    /// One pass over the synchronous registrations. Returns the number of items removed.
    pub fn leak_once(&self) -> u64 {
        self.shared.leak_sync()
    }

    /// One pass over the async registrations.
    pub async fn leak_once_async(&self) -> u64 {
        self.shared.leak_async().await
    }

    pub fn sync_len(&self) -> usize {
        self.shared.sync().entries.len()
    }

    pub fn async_len(&self) -> usize {
        self.shared.tasks().entries.len()
    }

    pub fn is_worker_running(&self) -> bool {
        self.shared.sync().worker_running
    }

    pub fn has_async_task(&self) -> bool {
        self.shared.tasks().task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Leaker {
    fn drop(&mut self) {
        self.deregister_all();
    }
}
