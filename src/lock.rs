//! Deadline-aware locks and the ordered lock set taken by the limiter.
//!
//! Guards in this module are not tied to the acquiring thread: a lock taken on one worker may be
//! released from another, which is what lets the async face hold them across `.await`.

use crate::error::LockTimeout;
use async_trait::async_trait;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A lock that can be acquired with an optional deadline from both faces.
///
/// A deadline already in the past means "try exactly once"; `None` waits indefinitely.
#[async_trait]
pub trait TimedLock: Send + Sync + std::fmt::Debug {
    fn acquire_until(&self, deadline: Option<Instant>) -> bool;

    async fn acquire_until_async(&self, deadline: Option<Instant>) -> bool;

    fn release(&self);
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// In-process mutual exclusion usable from threads and tasks alike.
#[derive(Debug, Default)]
pub struct ProcessLock {
    held: Mutex<bool>,
    released: Condvar,
    notify: Notify,
}

impl ProcessLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TimedLock for ProcessLock {
    fn acquire_until(&self, deadline: Option<Instant>) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while *held {
            match deadline {
                None => {
                    held = self.released.wait(held).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    held = self
                        .released
                        .wait_timeout(held, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
        *held = true;
        true
    }

    async fn acquire_until_async(&self, deadline: Option<Instant>) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire() {
                return true;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    let deadline = tokio::time::Instant::from_std(deadline);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_acquire();
                    }
                }
            }
        }
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        *held = false;
        drop(held);
        self.released.notify_all();
        self.notify.notify_waiters();
    }
}

const POLL_MIN_MS: u64 = 2;
const POLL_MAX_MS: u64 = 8;

/// Cross-process exclusive lock on a lock file (`fs2` advisory locking).
///
/// Re-entrant within one `FileLock` value: nested acquisitions bump a hold count and the OS lock
/// is dropped when the count returns to zero. In-process exclusion is left to the lock taken
/// after it.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
    holders: Mutex<usize>,
}

impl FileLock {
    /// Open (creating if needed) the lock file at `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        Ok(Self { path, file, holders: Mutex::new(0) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of outstanding holds taken through this value.
    pub fn holders(&self) -> usize {
        *self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_once(&self) -> bool {
        let mut holders = self.holders.lock().unwrap_or_else(|e| e.into_inner());
        if *holders > 0 {
            *holders += 1;
            return true;
        }
        match fs2::FileExt::try_lock_exclusive(&self.file) {
            Ok(()) => {
                *holders = 1;
                true
            }
            Err(err) if is_contended(&err) => false,
            Err(err) => {
                warn!(target: "ratewindow::lock", path = %self.path.display(), error = %err, "file lock attempt failed");
                false
            }
        }
    }

    fn poll_delay(deadline: Option<Instant>) -> Duration {
        let jitter = Duration::from_millis(rand::rng().random_range(POLL_MIN_MS..=POLL_MAX_MS));
        match deadline {
            Some(deadline) => jitter.min(deadline.saturating_duration_since(Instant::now())),
            None => jitter,
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[async_trait]
impl TimedLock for FileLock {
    fn acquire_until(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.try_once() {
                return true;
            }
            if expired(deadline) {
                return false;
            }
            std::thread::sleep(Self::poll_delay(deadline));
        }
    }

    async fn acquire_until_async(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.try_once() {
                return true;
            }
            if expired(deadline) {
                return false;
            }
            tokio::time::sleep(Self::poll_delay(deadline)).await;
        }
    }

    fn release(&self) {
        let mut holders = self.holders.lock().unwrap_or_else(|e| e.into_inner());
        match *holders {
            0 => {}
            1 => {
                *holders = 0;
                if let Err(err) = fs2::FileExt::unlock(&self.file) {
                    warn!(target: "ratewindow::lock", path = %self.path.display(), error = %err, "file unlock failed");
                }
            }
            _ => *holders -= 1,
        }
    }
}

/// Ordered collection of locks acquired together under one deadline.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    locks: Vec<Arc<dyn TimedLock>>,
}

impl LockSet {
    /// Locks are acquired in the given order and released in reverse.
    pub fn new(locks: Vec<Arc<dyn TimedLock>>) -> Self {
        Self { locks }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Acquire every lock or none. `Some(Duration::ZERO)` tries each lock once.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<LockSetGuard, LockTimeout> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = LockSetGuard { held: Vec::with_capacity(self.locks.len()) };
        for lock in &self.locks {
            if !lock.acquire_until(deadline) {
                debug!(target: "ratewindow::lock", held = guard.held.len(), "lock set timed out, rolling back");
                return Err(LockTimeout { budget: timeout });
            }
            guard.held.push(lock.clone());
        }
        Ok(guard)
    }

    /// Async acquisition. Dropping the future releases whatever was already taken.
    pub async fn acquire_async(&self, timeout: Option<Duration>) -> Result<LockSetGuard, LockTimeout> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = LockSetGuard { held: Vec::with_capacity(self.locks.len()) };
        for lock in &self.locks {
            if !lock.acquire_until_async(deadline).await {
                debug!(target: "ratewindow::lock", held = guard.held.len(), "lock set timed out, rolling back");
                return Err(LockTimeout { budget: timeout });
            }
            guard.held.push(lock.clone());
        }
        Ok(guard)
    }
}

/// Scoped ownership of an acquired [`LockSet`].
#[derive(Debug)]
pub struct LockSetGuard {
    held: Vec<Arc<dyn TimedLock>>,
}

impl LockSetGuard {
    pub fn held(&self) -> usize {
        self.held.len()
    }
}

impl Drop for LockSetGuard {
    fn drop(&mut self) {
        while let Some(lock) = self.held.pop() {
            lock.release();
        }
    }
}
