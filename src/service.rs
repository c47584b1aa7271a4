//! hyper integration: adapters that let an [`Engine`] serve as a hyper
//! `Service`, aggregating each request body into `Bytes` before dispatch.

use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::future::BoxFuture;
use hyper::service::Service;
use hyper::{Body, Request, Response};

use crate::Engine;

/// A cloneable hyper `Service` dispatching every request through a shared
/// [`Engine`].
#[derive(Clone)]
pub struct EngineService(pub Arc<Engine>);

impl Service<Request<Body>> for EngineService {
    type Response = Response<Body>;
    type Error = hyper::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let engine = Arc::clone(&self.0);
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let bytes = hyper::body::to_bytes(body).await?;
            let response = engine.serve(Request::from_parts(parts, bytes)).await;
            Ok(response.map(Body::from))
        })
    }
}

/// The `MakeService` hyper's server loop expects: hands out a clone of the
/// inner [`EngineService`] per connection.
pub struct MakeEngineService(pub EngineService);

impl<T> Service<T> for MakeEngineService {
    type Response = EngineService;
    type Error = hyper::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: T) -> Self::Future {
        let service = self.0.clone();
        Box::pin(async move { Ok(service) })
    }
}

impl Engine {
    /// Converts the engine into a hyper `MakeService`.
    ///
    /// ```rust,no_run
    /// # use turnpike::Engine;
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let engine = Engine::default();
    ///
    /// hyper::Server::bind(&([127, 0, 0, 1], 3000).into())
    ///     .serve(engine.into_service())
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn into_service(self) -> MakeEngineService {
        MakeEngineService(EngineService(Arc::new(self)))
    }
}
