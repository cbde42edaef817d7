//! Function wrappers that acquire before calling.
//!
//! ```
//! use ratewindow::{InMemoryBucket, Limiter, Rate};
//! use std::sync::Arc;
//!
//! let bucket = InMemoryBucket::new(vec![Rate::new(10, 1_000).unwrap()]).unwrap();
//! let limiter = Arc::new(Limiter::new(Arc::new(bucket)).unwrap());
//! let decorator = limiter.as_decorator(|user: &String| (format!("user:{}", user), 1));
//! let greet = decorator.wrap(|user: String| format!("hello {}", user));
//! assert_eq!(greet("ada".to_string()).unwrap(), "hello ada");
//! ```

use crate::limiter::Limiter;
use crate::LimiterError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Wraps callables so each call first acquires `(name, weight)` computed from its arguments.
///
/// Arguments are passed as one value (use a tuple for several). The callee only runs after a
/// successful acquisition; its return value is passed through untouched. A refused acquisition
/// yields [`LimiterError::Denied`], or the policy error when the limiter raises.
pub struct LimiterDecorator<M> {
    limiter: Arc<Limiter>,
    mapping: Arc<M>,
}

impl<M> Clone for LimiterDecorator<M> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), mapping: self.mapping.clone() }
    }
}

impl<M> std::fmt::Debug for LimiterDecorator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterDecorator").field("limiter", &self.limiter).finish()
    }
}

fn denied(name: String, weight: u64) -> LimiterError {
    LimiterError::Denied { name, weight }
}

impl<M> LimiterDecorator<M> {
    pub fn new(limiter: Arc<Limiter>, mapping: M) -> Self {
        Self { limiter, mapping: Arc::new(mapping) }
    }

    /// Wrap a synchronous callee; waits block the calling thread.
    pub fn wrap<A, R, F>(&self, f: F) -> impl Fn(A) -> Result<R, LimiterError>
    where
        M: Fn(&A) -> (String, u64),
        F: Fn(A) -> R,
    {
        let limiter = self.limiter.clone();
        let mapping = self.mapping.clone();
        move |args: A| {
            let (name, weight) = (*mapping)(&args);
            if limiter.try_acquire(&name, weight)? {
                Ok(f(args))
            } else {
                Err(denied(name, weight))
            }
        }
    }

    /// Wrap an async callee; waits are cooperative.
    pub fn wrap_async<A, R, F, Fut>(&self, f: F) -> impl Fn(A) -> BoxFuture<'static, Result<R, LimiterError>>
    where
        M: Fn(&A) -> (String, u64),
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        A: Send + 'static,
        R: Send + 'static,
    {
        let limiter = self.limiter.clone();
        let mapping = self.mapping.clone();
        let f = Arc::new(f);
        move |args: A| {
            let (name, weight) = (*mapping)(&args);
            let limiter = limiter.clone();
            let f = f.clone();
            async move {
                if limiter.try_acquire_async(&name, weight).await? {
                    Ok((*f)(args).await)
                } else {
                    Err(denied(name, weight))
                }
            }
            .boxed()
        }
    }
}
