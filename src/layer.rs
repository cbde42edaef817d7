//! Tower middleware that acquires from a [`Limiter`] before each request.

use crate::error::LayerError;
use crate::limiter::{AcquireOptions, Limiter};
use crate::LimiterError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Maps a request to the `(name, weight)` it should be charged.
pub type RequestMapper<Req> = Arc<dyn Fn(&Req) -> (String, u64) + Send + Sync>;

/// A layer that enforces rate limits using a shared [`Limiter`].
pub struct RateLimitLayer<Req> {
    limiter: Arc<Limiter>,
    mapper: RequestMapper<Req>,
    options: AcquireOptions,
}

impl<Req> Clone for RateLimitLayer<Req> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), mapper: self.mapper.clone(), options: self.options }
    }
}

impl<Req> std::fmt::Debug for RateLimitLayer<Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLayer").field("options", &self.options).finish()
    }
}

impl<Req> RateLimitLayer<Req> {
    /// Create a new rate limit layer.
    pub fn new<F>(limiter: Arc<Limiter>, mapper: F) -> Self
    where
        F: Fn(&Req) -> (String, u64) + Send + Sync + 'static,
    {
        Self { limiter, mapper: Arc::new(mapper), options: AcquireOptions::default() }
    }

    /// Charge every request to `name` with weight 1.
    pub fn per_key(limiter: Arc<Limiter>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(limiter, move |_: &Req| (name.clone(), 1))
    }

    /// Acquisition options used for every request (default: blocking, no timeout).
    pub fn with_options(mut self, options: AcquireOptions) -> Self {
        self.options = options;
        self
    }
}

impl<S, Req> Layer<S> for RateLimitLayer<Req> {
    type Service = RateLimitService<S, Req>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            mapper: self.mapper.clone(),
            options: self.options,
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, Req> {
    inner: S,
    limiter: Arc<Limiter>,
    mapper: RequestMapper<Req>,
    options: AcquireOptions,
}

impl<S: Clone, Req> Clone for RateLimitService<S, Req> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            mapper: self.mapper.clone(),
            options: self.options,
        }
    }
}

impl<S: std::fmt::Debug, Req> std::fmt::Debug for RateLimitService<S, Req> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitService").field("inner", &self.inner).field("options", &self.options).finish()
    }
}

impl<S, Req> Service<Req> for RateLimitService<S, Req>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = LayerError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LayerError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let options = self.options;
        let (name, weight) = (*self.mapper)(&req);
        // take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if limiter.try_acquire_async_with(&name, weight, options).await? {
                inner.call(req).await.map_err(LayerError::Inner)
            } else {
                Err(LayerError::Limiter(LimiterError::Denied { name, weight }))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockSource, ManualClock};
    use crate::{InMemoryBucket, Rate};
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    fn limiter(limit: u64) -> Arc<Limiter> {
        let bucket = Arc::new(InMemoryBucket::new(vec![Rate::new(limit, 60_000).unwrap()]).unwrap());
        Arc::new(
            Limiter::builder()
                .bucket(bucket)
                .clock(ClockSource::sync(ManualClock::new(0)))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn requests_beyond_the_limit_are_refused() {
        let layer = RateLimitLayer::per_key(limiter(2), "svc").with_options(AcquireOptions::non_blocking());
        let svc = layer.layer(service_fn(|n: u32| async move { Ok::<_, Infallible>(n + 1) }));

        assert_eq!(svc.clone().oneshot(1).await.unwrap(), 2);
        assert_eq!(svc.clone().oneshot(2).await.unwrap(), 3);
        let err = svc.oneshot(3).await.unwrap_err();
        assert!(err.is_limited());
    }

    #[tokio::test]
    async fn mapper_weights_requests() {
        let layer = RateLimitLayer::new(limiter(5), |req: &(String, u64)| (req.0.clone(), req.1))
            .with_options(AcquireOptions::non_blocking());
        let svc = layer.layer(service_fn(|req: (String, u64)| async move { Ok::<_, Infallible>(req.1) }));

        assert_eq!(svc.clone().oneshot(("a".into(), 4)).await.unwrap(), 4);
        match svc.clone().oneshot(("b".into(), 2)).await.unwrap_err() {
            LayerError::Limiter(LimiterError::Denied { name, weight }) => assert_eq!((name.as_str(), weight), ("b", 2)),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(svc.oneshot(("c".into(), 6)).await.unwrap_err().is_limited());
    }

    #[tokio::test]
    async fn inner_errors_are_wrapped() {
        let layer = RateLimitLayer::per_key(limiter(10), "svc");
        let svc = layer.layer(service_fn(|_: ()| async { Err::<(), _>(std::io::Error::other("down")) }));
        let err = svc.oneshot(()).await.unwrap_err();
        assert!(!err.is_limited());
        assert_eq!(err.into_inner().unwrap().to_string(), "down");
    }
}
