//! The handler the cache layer falls through to on a miss.

use std::future::Future;

use crate::http::{Request, Response, ResponseWriter, writer::write_response};

use super::store::BoxFuture;

/// One-shot invocation of the downstream handler for a single request.
///
/// `invoke` consumes the backend handle, so a request can reach the backend at
/// most once. Shared handlers implement this for a reference (see
/// [`ServiceFn`]); per-request handles such as
/// [`Next`](crate::middleware::Next) implement it by value.
///
/// The returned future must have written the complete response (headers,
/// status, body) into `writer` by the time it resolves.
pub trait Backend: Send {
    fn invoke<'a>(self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()>
    where
        Self: 'a;
}

/// Adapts an async `Fn(Request) -> Response` into a [`Backend`].
///
/// Created with [`service_fn`].
pub struct ServiceFn<F> {
    f: F,
}

/// Wraps `f` so `&ServiceFn<F>` can be passed as a [`Backend`] for any number
/// of requests.
///
/// # Examples
///
/// ```rust,no_run
/// use cacheproxy::cache::service_fn;
/// use cacheproxy::http::{Request, Response, StatusCode};
///
/// let backend = service_fn(|_req: Request| async {
///     Response::new(StatusCode::OK)
///         .header("Cache-Control", "max-age=30")
///         .body(r#"{"pong":true}"#)
/// });
/// ```
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    ServiceFn { f }
}

impl<'h, F, Fut> Backend for &'h ServiceFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn invoke<'a>(self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()>
    where
        Self: 'a,
    {
        let pending = (self.f)(request);
        Box::pin(async move {
            let response = pending.await;
            write_response(writer, response);
        })
    }
}
