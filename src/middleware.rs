//! Tower middleware that takes quota around every call.
//!
//! ```rust
//! use quotaflow::{Manager, QuotaLayer, RuleConfig};
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::builder()
//!     .rule(RuleConfig::new("limit-concurrency").limit(4).queueing("fifo"))
//!     .build()?;
//! let service = ServiceBuilder::new()
//!     .layer(QuotaLayer::new(manager))
//!     .service(service_fn(|req: u32| async move { Ok::<_, std::io::Error>(req * 2) }));
//! assert_eq!(service.oneshot(21).await?, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{QuotaError, ReportedError};
use crate::grant::Feedback;
use crate::manager::Manager;
use crate::resources::{RequestOptions, Resources};
use crate::scope::Scope;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Errors of a [`QuotaService`].
#[derive(Debug, thiserror::Error)]
pub enum QuotaServiceError<E> {
    /// No quota was granted; the inner service was not called.
    #[error("quota: {0}")]
    Quota(QuotaError),
    #[error("inner service: {0}")]
    Inner(E),
}

impl<E> QuotaServiceError<E> {
    pub fn is_quota(&self) -> bool {
        matches!(self, QuotaServiceError::Quota(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            QuotaServiceError::Inner(err) => Some(err),
            QuotaServiceError::Quota(_) => None,
        }
    }
}

/// Requests the same scope and resources from one manager for every call.
#[derive(Clone, Debug)]
pub struct QuotaLayer {
    manager: Arc<Manager>,
    scope: Scope,
    resources: Resources,
    options: RequestOptions,
}

impl QuotaLayer {
    pub fn new(manager: impl Into<Arc<Manager>>) -> Self {
        Self {
            manager: manager.into(),
            scope: Scope::new(),
            resources: Resources::Default,
            options: RequestOptions::default(),
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

impl<S> Layer<S> for QuotaLayer {
    type Service = QuotaService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        QuotaService { inner, quota: Arc::new(self.clone()) }
    }
}

#[derive(Clone, Debug)]
pub struct QuotaService<S> {
    inner: S,
    quota: Arc<QuotaLayer>,
}

impl<S, Req> Service<Req> for QuotaService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = QuotaServiceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(QuotaServiceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let quota = self.quota.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let grant = quota
                .manager
                .request_quota(&quota.scope, &quota.resources, &quota.options)
                .await
                .map_err(QuotaServiceError::Quota)?;
            match inner.call(req).await {
                Ok(response) => {
                    grant.release();
                    Ok(response)
                }
                Err(err) => {
                    grant.dismiss(Feedback::new().with_error(ReportedError::from(&err)));
                    Err(QuotaServiceError::Inner(err))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::rule::RuleConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("upstream failed")]
    struct Upstream;

    fn manager(limit: u64) -> Arc<Manager> {
        Arc::new(
            Manager::builder()
                .label("svc")
                .rule(RuleConfig::new("limit-concurrency").name("main").limit(limit))
                .backoff(Backoff::timeout(Duration::from_millis(50)))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn releases_after_success() {
        let manager = manager(1);
        let service = ServiceBuilder::new()
            .layer(QuotaLayer::new(manager.clone()))
            .service(service_fn(|n: u32| async move { Ok::<_, Upstream>(n + 1) }));

        assert_eq!(service.clone().oneshot(1).await.unwrap(), 2);
        assert_eq!(service.oneshot(2).await.unwrap(), 3);
        assert_eq!(manager.rules()[0].bundle(&Scope::new()).unwrap().used(), 0);
    }

    #[tokio::test]
    async fn inner_errors_activate_the_backoff() {
        let manager = manager(1);
        let service = QuotaLayer::new(manager.clone())
            .layer(service_fn(|_: ()| async { Err::<(), _>(Upstream) }));

        let err = service.oneshot(()).await.unwrap_err();
        assert_eq!(err.into_inner(), Some(Upstream));
        assert!(manager.backoff().unwrap().is_active());
    }

    #[tokio::test]
    async fn denied_calls_never_reach_the_inner_service() {
        let manager = manager(1);
        let _held = manager.request_quota(&Scope::new(), &Resources::Default, &RequestOptions::default()).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let service = QuotaLayer::new(manager).options(RequestOptions::max_wait(Duration::ZERO)).layer(
            service_fn(move |_: ()| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Upstream>(()) }
            }),
        );

        let err = service.oneshot(()).await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(err.to_string(), "quota: Ran out of quota for svc");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
