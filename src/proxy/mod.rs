//! Reverse-proxy backend: forwards requests to an upstream HTTP/1.1 origin.
//!
//! The upstream response is streamed into the response sink as it arrives:
//! interim `1xx` heads are passed through, then the final head, then body data
//! framed by `Content-Length`, chunked transfer coding, or connection close.
//! Each upstream request uses its own connection (`Connection: close`).

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cache::{Backend, BoxFuture};
use crate::http::{Headers, Method, Request, Response, ResponseWriter, StatusCode, writer::write_response};

/// Upper bound on a response head we will buffer.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

const INITIAL_BUF_SIZE: usize = 8192;

// Meaningful for one connection only; never forwarded in either direction.
const HOP_BY_HOP: [&str; 7] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "TE",
    "Trailer",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Errors talking to the upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed upstream response: {0}")]
    Parse(#[from] httparse::Error),

    #[error("upstream closed the connection mid-response")]
    Truncated,

    #[error("upstream response head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("malformed chunked body")]
    BadChunk,
}

enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

enum Chunk {
    Data(Bytes),
    End,
}

/// A [`Backend`] that forwards to `upstream` (`host:port`).
///
/// Connection and I/O failures before the upstream status is known are
/// answered with `502 Bad Gateway`; after that the response is cut short.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cacheproxy::cache::{CacheConfig, CacheLayer, MemoryStore};
/// use cacheproxy::proxy::ProxyBackend;
/// use cacheproxy::http::{Method, Request};
///
/// # async fn run() {
/// let layer = CacheLayer::new(Arc::new(MemoryStore::new()), CacheConfig::default());
/// let upstream = ProxyBackend::new("127.0.0.1:4000");
/// let request = Request::new(Method::Post, "/graphql").with_body(r#"{"query":"{ping}"}"#);
/// let response = layer.handle(request, &upstream).await;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProxyBackend {
    upstream: String,
}

impl ProxyBackend {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    fn outbound(&self, mut request: Request) -> Request {
        let headers = request.headers_mut();
        for name in HOP_BY_HOP {
            headers.remove(name);
        }
        headers.set("Host", self.upstream.as_str());
        headers.set("Connection", "close");
        request
    }

    async fn forward(
        &self,
        request: Request,
        writer: &mut dyn ResponseWriter,
        committed: &mut bool,
    ) -> Result<(), ProxyError> {
        let mut stream = TcpStream::connect(&self.upstream)
            .await
            .map_err(|source| ProxyError::Connect {
                addr: self.upstream.clone(),
                source,
            })?;

        let head_only = *request.method() == Method::Head;
        stream.write_all(&self.outbound(request).to_bytes()).await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let (status, headers) = loop {
            let (status, headers) = read_head(&mut stream, &mut buf).await?;
            if status.is_informational() {
                debug!(status = status.as_u16(), "interim upstream response");
                writer.write_header(status);
                continue;
            }
            break (status, headers);
        };

        let framing = framing(&headers, status, head_only);
        let sink = writer.headers_mut();
        for (name, value) in headers.iter() {
            if !is_hop_by_hop(name) {
                sink.insert(name, value);
            }
        }
        writer.write_header(status);
        *committed = true;

        match framing {
            Framing::Empty => {}
            Framing::Length(mut remaining) => loop {
                if !buf.is_empty() {
                    let take = remaining.min(buf.len());
                    writer.write(&buf.split_to(take));
                    remaining -= take;
                }
                if remaining == 0 {
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    return Err(ProxyError::Truncated);
                }
            },
            Framing::Chunked => loop {
                match take_chunk(&mut buf)? {
                    Some(Chunk::Data(data)) => {
                        writer.write(&data);
                    }
                    Some(Chunk::End) => break,
                    None => {
                        if stream.read_buf(&mut buf).await? == 0 {
                            return Err(ProxyError::Truncated);
                        }
                    }
                }
            },
            Framing::UntilClose => loop {
                if !buf.is_empty() {
                    writer.write(&buf.split());
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    break;
                }
            },
        }

        Ok(())
    }
}

impl<'p> Backend for &'p ProxyBackend {
    fn invoke<'a>(self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()>
    where
        Self: 'a,
    {
        Box::pin(async move {
            let mut committed = false;
            if let Err(e) = self.forward(request, writer, &mut committed).await {
                warn!(upstream = %self.upstream, error = %e, "upstream request failed");
                if !committed {
                    write_response(
                        writer,
                        Response::new(StatusCode::BAD_GATEWAY).body("Error contacting backend"),
                    );
                }
            }
        })
    }
}

async fn read_head(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<(StatusCode, Headers), ProxyError> {
    loop {
        if let Some((status, headers, consumed)) = parse_head(buf)? {
            let _ = buf.split_to(consumed);
            return Ok((status, headers));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyError::Truncated);
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(StatusCode, Headers, usize)>, ProxyError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut head = httparse::Response::new(&mut raw_headers);

    let consumed = match head.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };
    let code = head.code.ok_or(ProxyError::Parse(httparse::Error::Status))?;

    let mut headers = Headers::with_capacity(head.headers.len());
    for header in head.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            headers.insert(header.name, value);
        }
    }
    Ok(Some((StatusCode::from_u16(code), headers, consumed)))
}

fn framing(headers: &Headers, status: StatusCode, head_only: bool) -> Framing {
    if head_only || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Framing::Empty;
    }
    let chunked = headers
        .get_all("transfer-encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Framing::Chunked;
    }
    match headers
        .get("content-length")
        .and_then(|v| v.trim().parse().ok())
    {
        Some(0) => Framing::Empty,
        Some(n) => Framing::Length(n),
        None => Framing::UntilClose,
    }
}

fn take_chunk(buf: &mut BytesMut) -> Result<Option<Chunk>, ProxyError> {
    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| ProxyError::BadChunk)?;
    let size_hex = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_hex, 16).map_err(|_| ProxyError::BadChunk)?;
    if size == 0 {
        return Ok(Some(Chunk::End));
    }

    let data_start = line_end + 2;
    let frame_end = data_start
        .checked_add(size)
        .and_then(|end| end.checked_add(2))
        .ok_or(ProxyError::BadChunk)?;
    if buf.len() < frame_end {
        return Ok(None);
    }
    if &buf[frame_end - 2..frame_end] != b"\r\n" {
        return Err(ProxyError::BadChunk);
    }
    let frame = buf.split_to(frame_end);
    Ok(Some(Chunk::Data(Bytes::copy_from_slice(
        &frame[data_start..data_start + size],
    ))))
}
