//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, so a cache can sit in front of
//! whatever the rest of the chain does without the handlers knowing.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer. `Next` is also a [`Backend`], so the rest of
//!   the chain can serve cache misses.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`CacheMiddleware`]: mounts a [`CacheLayer`] in the chain.
//! - [`LoggerMiddleware`]: request/response access log.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::cache::{Backend, BoxFuture, CacheLayer};
use crate::http::{ResponseWriter, writer::write_response};
use crate::{Request, Response, StatusCode, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// Calling [`Next::run`] advances the cursor by one position and invokes the
/// next middleware, or returns a fallback `500` response when the chain is
/// exhausted without any middleware generating a response.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cacheproxy::{Response, StatusCode, context::Context, middleware::{MiddlewareHandler, Next}};
///
/// let origin: MiddlewareHandler = Arc::new(|_ctx: Context, _next: Next| {
///     Box::pin(async { Response::new(StatusCode::OK).body("origin") })
/// });
/// ```
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                .body("No response generated by middleware pipeline")
        }
    }
}

impl Backend for Next {
    fn invoke<'a>(self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()>
    where
        Self: 'a,
    {
        Box::pin(async move {
            let response = self.run(Context::new(request)).await;
            write_response(writer, response);
        })
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may pass
/// through, short-circuit with their own [`Response`], or decorate the
/// downstream response.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Serves requests through a [`CacheLayer`], using the rest of the chain as
/// the backend on a miss.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cacheproxy::cache::{CacheConfig, CacheLayer, MemoryStore};
/// use cacheproxy::middleware::{CacheMiddleware, from_middleware};
///
/// let layer = CacheLayer::new(Arc::new(MemoryStore::new()), CacheConfig::default());
/// let handler = from_middleware(Arc::new(CacheMiddleware::new(layer)));
/// ```
pub struct CacheMiddleware {
    layer: CacheLayer,
}

impl CacheMiddleware {
    pub fn new(layer: CacheLayer) -> Self {
        Self { layer }
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let layer = self.layer.clone();
        Box::pin(async move { layer.handle(ctx.into_request(), next).await })
    }
}

/// Logs each request's method, path, GraphQL operation name, status, cache
/// status and duration.
///
/// Emits a single `tracing::info!` line after the downstream handler completes.
/// Mount it outside [`CacheMiddleware`] to see `X-Cache` in the log.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();
            let operation = ctx.operation_name().unwrap_or_else(|| "-".to_string());

            let response = next.run(ctx).await;

            let cache = response.headers().get("x-cache").unwrap_or("-").to_string();
            tracing::info!(
                %method,
                %path,
                %operation,
                status = response.status().as_u16(),
                %cache,
                duration = ?start.elapsed(),
                "request served"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::Method;
    use crate::cache::{CacheConfig, MemoryStore};

    fn origin(calls: Arc<AtomicUsize>) -> MiddlewareHandler {
        Arc::new(move |ctx: Context, _next: Next| {
            calls.fetch_add(1, Ordering::SeqCst);
            let echoed = ctx.request().body().to_vec();
            Box::pin(async move {
                Response::new(StatusCode::OK)
                    .header("Cache-Control", "max-age=60")
                    .body_bytes(echoed)
            })
        })
    }

    fn chain(calls: Arc<AtomicUsize>, layer: &CacheLayer) -> Vec<MiddlewareHandler> {
        vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            from_middleware(Arc::new(CacheMiddleware::new(layer.clone()))),
            origin(calls),
        ]
    }

    fn request() -> Context {
        Context::new(Request::new(Method::Post, "/graphql").with_body(r#"{"query":"{me}"}"#))
    }

    #[tokio::test]
    async fn exhausted_chain_returns_500() {
        let res = Next::new(vec![]).run(request()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn cache_middleware_serves_repeat_from_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = CacheLayer::new(Arc::new(MemoryStore::new()), CacheConfig::default());

        let first = Next::new(chain(calls.clone(), &layer)).run(request()).await;
        assert_eq!(first.headers().get("x-cache"), Some("MISS"));
        assert_eq!(first.content(), br#"{"query":"{me}"}"#);

        let second = Next::new(chain(calls.clone(), &layer)).run(request()).await;
        assert_eq!(second.headers().get("x-cache"), Some("HIT"));
        assert_eq!(second.content(), br#"{"query":"{me}"}"#);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
