//! Process-wide limiter handle.
//!
//! Worker pools call [`initialize`] from their per-worker initializer and [`teardown`] on shutdown.
//! Nothing is installed implicitly; acquiring before `initialize` is a configuration error.

use crate::limiter::Limiter;
use crate::LimiterError;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::warn;

static GLOBAL: ArcSwapOption<Limiter> = ArcSwapOption::const_empty();

/// Install `limiter` as the process-wide handle, returning the one it replaced.
pub fn initialize(limiter: Arc<Limiter>) -> Option<Arc<Limiter>> {
    let previous = GLOBAL.swap(Some(limiter));
    if previous.is_some() {
        warn!(target: "ratewindow::limiter", "process-wide limiter replaced");
    }
    previous
}

pub fn current() -> Option<Arc<Limiter>> {
    GLOBAL.load_full()
}

pub fn is_initialized() -> bool {
    GLOBAL.load().is_some()
}

/// Blocking acquire through the installed limiter.
pub fn try_acquire(name: &str, weight: u64) -> Result<bool, LimiterError> {
    match GLOBAL.load_full() {
        Some(limiter) => limiter.try_acquire(name, weight),
        None => Err(LimiterError::invalid("process-wide limiter is not initialized")),
    }
}

pub async fn try_acquire_async(name: &str, weight: u64) -> Result<bool, LimiterError> {
    match GLOBAL.load_full() {
        Some(limiter) => limiter.try_acquire_async(name, weight).await,
        None => Err(LimiterError::invalid("process-wide limiter is not initialized")),
    }
}

/// Remove the handle and close it. The limiter's factory is closed only if it owns it.
pub fn teardown() -> Result<(), LimiterError> {
    match GLOBAL.swap(None) {
        Some(limiter) => limiter.close(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBucket, Rate};

    // One test drives the whole lifecycle since the handle is shared by every test in the binary.
    #[test]
    fn lifecycle_is_explicit() {
        assert!(try_acquire("a", 1).unwrap_err().is_invalid_config());
        assert!(!is_initialized());

        let bucket = Arc::new(InMemoryBucket::new(vec![Rate::new(1, 60_000).unwrap()]).unwrap());
        let limiter = Arc::new(Limiter::builder().bucket(bucket).max_delay(std::time::Duration::ZERO).build().unwrap());
        assert!(initialize(limiter.clone()).is_none());
        assert!(Arc::ptr_eq(&current().unwrap(), &limiter));

        assert!(try_acquire("a", 1).unwrap());
        assert!(!try_acquire("a", 1).unwrap());

        teardown().unwrap();
        assert!(current().is_none());
        assert!(limiter.try_acquire("a", 1).unwrap_err().is_invalid_config());
        teardown().unwrap();
    }
}
