//! Request lifecycle state machine.
//!
//! ```text
//! Received ─▶ CacheLookup ─┬─ hit ──────────────▶ Deliver ─────────────────────▶ Done
//!                          └─ miss/error ─▶ BackendInvoke ─▶ PolicyEvaluate ─┬─▶ Cache ─▶ Done
//!                                                                            └──────────▶ Done
//! ```
//!
//! Every failure on the cache path degrades to "miss" or "skip the write".
//! There is no retry edge back into `CacheLookup`, and concurrent misses on the
//! same key each reach the backend (last write wins in the store).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::http::{Request, Response, ResponseBuffer, ResponseWriter};

use super::backend::Backend;
use super::capture::{CaptureWriter, Captured, stamp};
use super::codec::{self, ResponseEnvelope, is_transport_header};
use super::config::CacheConfig;
use super::hash::CacheKey;
use super::policy::{self, Verdict};
use super::store::CacheStore;

/// How one request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Replayed from the store; the backend was not called.
    Hit,
    /// Served by the backend. `stored` is whether the response was written to
    /// the store afterwards.
    Miss { stored: bool },
}

impl Outcome {
    /// Value of the `X-Cache` header the client saw.
    pub fn cache_status(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss { .. } => "MISS",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cache_status())
    }
}

// The backend handle travels through the states that may still need it, so it
// can be consumed at most once.
enum State<B> {
    CacheLookup(B),
    Deliver(ResponseEnvelope),
    BackendInvoke(B),
    PolicyEvaluate(Captured),
    Cache { captured: Captured, ttl: u64 },
    Done(Outcome),
}

impl<B> State<B> {
    fn name(&self) -> &'static str {
        match self {
            Self::CacheLookup(_) => "cache_lookup",
            Self::Deliver(_) => "deliver",
            Self::BackendInvoke(_) => "backend_invoke",
            Self::PolicyEvaluate(_) => "policy_evaluate",
            Self::Cache { .. } => "cache",
            Self::Done(_) => "done",
        }
    }
}

/// Everything one request owns while it moves through the machine.
struct Exchange<'w> {
    request: Request,
    key: CacheKey,
    started: Instant,
    writer: &'w mut dyn ResponseWriter,
}

/// Transparent response cache in front of a [`Backend`].
///
/// Cheap to clone; clones share the store and configuration.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cacheproxy::cache::{CacheConfig, CacheLayer, MemoryStore, service_fn};
/// use cacheproxy::http::{Method, Request, Response, StatusCode};
///
/// # async fn run() {
/// let layer = CacheLayer::new(Arc::new(MemoryStore::new()), CacheConfig::default());
/// let backend = service_fn(|_req: Request| async {
///     Response::new(StatusCode::OK)
///         .header("Cache-Control", "max-age=30")
///         .body(r#"{"pong":true}"#)
/// });
///
/// let request = Request::new(Method::Post, "/graphql").with_body(r#"{"query":"{ping}"}"#);
/// let response = layer.handle(request, &backend).await;
/// assert_eq!(response.headers().get("x-cache"), Some("MISS"));
/// # }
/// ```
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<dyn CacheStore>,
    config: Arc<CacheConfig>,
}

impl CacheLayer {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Serves `request` into an in-memory sink and returns the assembled response.
    pub async fn handle<B: Backend>(&self, request: Request, backend: B) -> Response {
        let mut sink = ResponseBuffer::new();
        self.serve(request, backend, &mut sink).await;
        sink.into_response()
    }

    /// Runs one request through the state machine, writing the response to `writer`.
    pub async fn serve<B: Backend>(
        &self,
        request: Request,
        backend: B,
        writer: &mut dyn ResponseWriter,
    ) -> Outcome {
        let mut exchange = self.receive(request, writer);
        let mut state = State::CacheLookup(backend);

        loop {
            debug!(key = %exchange.key, state = state.name(), "transition");
            state = match state {
                State::CacheLookup(backend) => self.lookup(&mut exchange, backend).await,
                State::Deliver(envelope) => self.deliver(&mut exchange, envelope),
                State::BackendInvoke(backend) => self.invoke(&mut exchange, backend).await,
                State::PolicyEvaluate(captured) => self.evaluate(&mut exchange, captured),
                State::Cache { captured, ttl } => self.cache(&mut exchange, captured, ttl).await,
                State::Done(outcome) => return outcome,
            };
        }
    }

    fn receive<'w>(&self, request: Request, writer: &'w mut dyn ResponseWriter) -> Exchange<'w> {
        let started = Instant::now();
        let key = CacheKey::for_request(&request, &self.config);
        Exchange {
            request,
            key,
            started,
            writer,
        }
    }

    async fn lookup<B: Backend>(&self, ex: &mut Exchange<'_>, backend: B) -> State<B> {
        let key = ex.key.as_str();
        match self.store.get(key).await {
            Err(e) => {
                warn!(key, error = %e, "cache store unavailable, falling through to backend");
                State::BackendInvoke(backend)
            }
            Ok(None) => {
                debug!(key, "cache miss");
                State::BackendInvoke(backend)
            }
            Ok(Some(data)) if data.is_empty() => {
                debug!(key, "empty cache entry, treating as miss");
                State::BackendInvoke(backend)
            }
            Ok(Some(data)) => match codec::decode(&data) {
                Ok(envelope) => {
                    info!(key, "cache hit");
                    State::Deliver(envelope)
                }
                Err(e) => {
                    error!(key, error = %e, "corrupt cache entry, treating as miss");
                    State::BackendInvoke(backend)
                }
            },
        }
    }

    fn deliver<B>(&self, ex: &mut Exchange<'_>, envelope: ResponseEnvelope) -> State<B> {
        let headers = ex.writer.headers_mut();
        for name in envelope.headers.names() {
            if is_transport_header(name) {
                continue;
            }
            if let Some(value) = envelope.headers.get_joined(name) {
                headers.set(name, value);
            }
        }
        stamp(headers, "HIT", &self.config.server_name, ex.started);

        ex.writer.write_header(envelope.status_or_ok());
        ex.writer.write(&envelope.body);
        State::Done(Outcome::Hit)
    }

    async fn invoke<B: Backend>(&self, ex: &mut Exchange<'_>, backend: B) -> State<B> {
        let mut capture = CaptureWriter::new(&mut *ex.writer, &self.config.server_name, ex.started);
        backend.invoke(ex.request.clone(), &mut capture).await;
        State::PolicyEvaluate(capture.finish())
    }

    fn evaluate<B>(&self, ex: &mut Exchange<'_>, captured: Captured) -> State<B> {
        let ttl = policy::ttl(&captured.headers);
        let verdict = policy::evaluate(
            ex.request.method(),
            ex.request.body(),
            captured.status,
            &captured.headers,
            ttl,
        );
        match verdict {
            Verdict::Cacheable { ttl } => State::Cache { captured, ttl },
            Verdict::Reject(reason) => {
                debug!(key = %ex.key, %reason, "response not cacheable");
                State::Done(Outcome::Miss { stored: false })
            }
        }
    }

    async fn cache<B>(&self, ex: &mut Exchange<'_>, captured: Captured, ttl: u64) -> State<B> {
        let key = ex.key.as_str();
        let envelope = ResponseEnvelope {
            method: ex.request.method().to_string(),
            status: Some(captured.status),
            headers: captured.headers,
            body: captured.body.freeze(),
        };

        let data = match codec::encode(&envelope) {
            Ok(data) => data,
            Err(e) => {
                error!(key, error = %e, "failed to serialize response, skipping cache write");
                return State::Done(Outcome::Miss { stored: false });
            }
        };

        match self
            .store
            .set(key, Bytes::from(data), Duration::from_secs(ttl))
            .await
        {
            Ok(()) => {
                info!(key, ttl, "cache put");
                State::Done(Outcome::Miss { stored: true })
            }
            Err(e) => {
                warn!(key, error = %e, "cache write failed");
                State::Done(Outcome::Miss { stored: false })
            }
        }
    }
}
