//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function, or straight into a [`CacheLayer`] with [`Server::run_cached`].
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::cache::{Backend, CacheLayer};
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The cacheproxy front server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cacheproxy::cache::{CacheConfig, CacheLayer, RedisStore};
/// use cacheproxy::proxy::ProxyBackend;
/// use cacheproxy::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = RedisStore::connect(RedisStore::DEFAULT_ADDR, RedisStore::DEFAULT_DATABASE).await?;
///     let layer = CacheLayer::new(Arc::new(store), CacheConfig::default());
///
///     let server = Server::bind("0.0.0.0:8080").await?;
///     server.run_cached(layer, ProxyBackend::new("graphql:4000")).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves every request through `layer`, with `backend` answering misses.
    ///
    /// The backend is shared by reference across connections, so any type whose
    /// shared reference is a [`Backend`] works, such as
    /// [`ProxyBackend`](crate::proxy::ProxyBackend) or
    /// [`ServiceFn`](crate::cache::ServiceFn).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_cached<T>(self, layer: CacheLayer, backend: T) -> Result<(), ServerError>
    where
        T: Send + Sync + 'static,
        for<'b> &'b T: Backend,
    {
        let backend = Arc::new(backend);
        self.run(move |request: Request| {
            let layer = layer.clone();
            let backend = Arc::clone(&backend);
            async move { layer.handle(request, &*backend).await }
        })
        .await
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives a [`Request`] and must return a [`Future`] that
    /// resolves to a [`Response`]. The handler is wrapped in an [`Arc`] and
    /// shared across all spawned Tokio tasks, so it must be `Send + Sync + 'static`.
    ///
    /// This method runs until the process is terminated or an unrecoverable
    /// listener error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "cacheproxy listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

fn reject(status: StatusCode, message: String) -> BytesMut {
    Response::new(status)
        .body(message)
        .keep_alive(false)
        .into_bytes()
}

/// Handles a single TCP connection over its lifetime.
///
/// Requests are read one at a time until the peer closes the connection or
/// signals `Connection: close`. A request body is only dispatched once all
/// `Content-Length` bytes have arrived, since its hash is the cache key.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Pipelined requests may already be buffered.
        if buf.is_empty() && stream.read_buf(&mut buf).await? == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let bytes = reject(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large".into());
            stream.write_all(&bytes).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "peer closed mid-request");
                    break;
                }
                continue;
            }
            Err(RequestError::LengthRequired) => {
                warn!(peer = %peer_addr, "chunked request body, sending 411");
                let bytes = reject(StatusCode::LENGTH_REQUIRED, "Length Required".into());
                stream.write_all(&bytes).await?;
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let bytes = reject(StatusCode::BAD_REQUEST, format!("Bad Request: {e}"));
                stream.write_all(&bytes).await?;
                break;
            }
        };

        let total_needed = body_offset.saturating_add(request.content_length().unwrap_or(0));
        if total_needed > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, declared = total_needed, "declared body too large, sending 413");
            let bytes = reject(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large".into());
            stream.write_all(&bytes).await?;
            break;
        }
        if buf.len() < total_needed {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "peer closed before sending the full body");
                break;
            }
            continue;
        }

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            body_len = request.body().len(),
            "dispatching request"
        );

        let response = handler(request).await;
        stream.write_all(&response.keep_alive(keep_alive).into_bytes()).await?;
        stream.flush().await?;

        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    async fn spawn_echo() -> SocketAddr {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            Response::new(StatusCode::OK).body_bytes(req.body().clone())
        }));
        addr
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn waits_for_the_whole_body() {
        let addr = spawn_echo().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stream.write_all(b"world").await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhelloworld"));
    }

    #[tokio::test]
    async fn malformed_request_is_400() {
        let addr = spawn_echo().await;
        let text = exchange(addr, b"NOT A REQUEST\x00\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn chunked_upload_is_411() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n0\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 411 Length Required\r\n"));
    }

    #[tokio::test]
    async fn bodiless_pipelined_requests_stay_separate() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"POST /a HTTP/1.1\r\n\r\nPOST /b HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(!text.contains("POST /b"));
    }

    #[tokio::test]
    async fn oversized_declared_body_is_413() {
        let addr = spawn_echo().await;
        let raw = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_SIZE + 1
        );
        let text = exchange(addr, raw.as_bytes()).await;
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let addr = spawn_echo().await;
        let raw = Request::new(Method::Post, "/")
            .with_body("one")
            .to_bytes();
        let mut both = raw.to_vec();
        both.extend_from_slice(
            &Request::new(Method::Post, "/")
                .with_header("Connection", "close")
                .with_body("two")
                .to_bytes(),
        );

        let text = exchange(addr, &both).await;
        let one = text.find("\r\n\r\none").unwrap();
        let two = text.find("\r\n\r\ntwo").unwrap();
        assert!(one < two);
    }
}
