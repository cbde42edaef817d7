#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratewindow
//!
//! Sliding-window log rate limiting. A [`Limiter`] admits `(name, weight)` requests against a
//! list of [`Rate`]s (`limit` units per `interval` milliseconds), waiting, refusing or raising
//! according to its [`Policy`].
//!
//! ## Features
//!
//! - **Sliding-window log** buckets: in-memory, file-backed multi-process, and (in sibling
//!   crates) SQLite, Redis and Postgres
//! - **Sync and async faces** over the same acquisition protocol
//! - **Background leaking** of expired items, one worker per factory
//! - **Cross-process locks** composed in a fixed order with rollback
//! - **Decorators** for plain functions and a **tower layer** for services
//!
//! ## Quick Start
//!
//! ```rust
//! use ratewindow::{duration::SECOND, AcquireOptions, InMemoryBucket, Limiter, Rate};
//! use std::sync::Arc;
//!
//! let rates = vec![Rate::new(5, SECOND).unwrap(), Rate::new(100, 60 * SECOND).unwrap()];
//! let limiter = Limiter::new(Arc::new(InMemoryBucket::new(rates).unwrap())).unwrap();
//!
//! for _ in 0..5 {
//!     assert!(limiter.try_acquire("api", 1).unwrap());
//! }
//! // the sixth call inside the same second would have to wait
//! assert!(!limiter.try_acquire_with("api", 1, AcquireOptions::non_blocking()).unwrap());
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod decorator;
pub mod duration;
pub mod error;
pub mod factory;
pub mod global;
pub mod layer;
pub mod leaker;
pub mod limiter;
pub mod lock;
pub mod logging;
pub mod rate;
pub mod sleeper;

// Re-exports
pub use bucket::{
    AsyncBucket, Bucket, BucketHandle, BucketId, InMemoryBucket, MultiprocessBucket, SyncBucketAdapter,
};
pub use clock::{AsyncClock, AsyncClockAdapter, Clock, ClockSource, ManualClock, MonotonicClock, SystemClock};
pub use config::LimiterConfig;
pub use decorator::LimiterDecorator;
pub use error::{BoxError, LayerError, LimiterError, LockTimeout};
pub use factory::{BucketFactory, BucketTemplate, DefaultBucketFactory, DefaultBucketFactoryBuilder};
pub use layer::{RateLimitLayer, RateLimitService};
pub use leaker::Leaker;
pub use limiter::{AcquireOptions, Limiter, LimiterBuilder, Policy};
pub use lock::{FileLock, LockSet, LockSetGuard, ProcessLock, TimedLock};
pub use rate::{Rate, RateItem};
pub use sleeper::{AdvancingSleeper, InstantSleeper, Sleeper, SystemSleeper, TrackingSleeper};
