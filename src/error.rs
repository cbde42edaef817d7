//! Error types for buckets, factories and limiters
use crate::rate::Rate;
use std::time::Duration;

/// Boxed backend error carried by the backend variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for rate limiting operations.
///
/// Only [`LimiterError::BucketFull`] and [`LimiterError::LimiterDelay`] are governed by the
/// limiter's `raise_when_fail` policy. Configuration errors and
/// [`LimiterError::WeightExceedsCapacity`] are always returned, backend failures are never
/// suppressed, and timeouts are reported as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// A rate list, weight or limiter configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested weight can never fit in the tightest rate.
    #[error("weight {weight} for '{name}' exceeds bucket capacity of {limit}")]
    WeightExceedsCapacity { name: String, weight: u64, limit: u64 },

    /// Admission was denied and the caller did not allow waiting.
    #[error("bucket for '{name}' rejected weight {weight}{}", describe_rate(.rate))]
    BucketFull { name: String, weight: u64, rate: Option<Rate> },

    /// Admission was denied and the required wait exceeds `max_delay`.
    #[error(
        "required delay {required_delay}ms for '{name}' (weight {weight}) exceeds max delay {max_delay}ms"
    )]
    LimiterDelay { name: String, weight: u64, required_delay: u64, max_delay: u64 },

    /// A wrapped call or service request was not admitted.
    #[error("request '{name}' with weight {weight} was not admitted")]
    Denied { name: String, weight: u64 },

    /// Recoverable backend failure (network blip, lock contention, busy database).
    #[error("transient backend error: {0}")]
    BackendTransient(#[source] BoxError),

    /// Unrecoverable backend failure (missing schema, auth failure, corrupt data).
    #[error("backend error: {0}")]
    BackendFatal(#[source] BoxError),
}

fn describe_rate(rate: &Option<Rate>) -> String {
    match rate {
        Some(rate) => format!(" ({} exceeded)", rate),
        None => String::new(),
    }
}

impl LimiterError {
    /// Wrap a recoverable backend error.
    pub fn transient<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::BackendTransient(err.into())
    }

    /// Wrap an unrecoverable backend error.
    pub fn fatal<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::BackendFatal(err.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendTransient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendFatal(_))
    }

    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }

    pub fn is_bucket_full(&self) -> bool {
        matches!(self, Self::BucketFull { .. })
    }

    pub fn is_delay(&self) -> bool {
        matches!(self, Self::LimiterDelay { .. })
    }

    pub fn is_weight_exceeded(&self) -> bool {
        matches!(self, Self::WeightExceedsCapacity { .. })
    }

    /// `(required_delay, max_delay)` in milliseconds for a delay error.
    pub fn delay_details(&self) -> Option<(u64, u64)> {
        match self {
            Self::LimiterDelay { required_delay, max_delay, .. } => {
                Some((*required_delay, *max_delay))
            }
            _ => None,
        }
    }

    /// Name of the request this error refers to, if any.
    pub fn item_name(&self) -> Option<&str> {
        match self {
            Self::WeightExceedsCapacity { name, .. }
            | Self::BucketFull { name, .. }
            | Self::LimiterDelay { name, .. }
            | Self::Denied { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A lock set could not be acquired before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{}", timeout_message(.budget))]
pub struct LockTimeout {
    /// Budget that was available for the acquisition, if bounded.
    pub budget: Option<Duration>,
}

fn timeout_message(budget: &Option<Duration>) -> String {
    match budget {
        Some(budget) => format!("lock acquisition timed out after {:?}", budget),
        None => "lock acquisition failed".to_string(),
    }
}

/// Error produced by [`crate::RateLimitService`].
#[derive(Debug, thiserror::Error)]
pub enum LayerError<E> {
    /// The limiter refused or failed the acquisition.
    #[error(transparent)]
    Limiter(#[from] LimiterError),
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> LayerError<E> {
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limiter(_))
    }

    /// Get the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Limiter(_) => None,
        }
    }
}
