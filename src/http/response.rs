//! A complete response as it leaves the front server.
//!
//! Everything a handler, a cache hit or a proxied upstream produced ends up
//! here before it is framed onto the client socket. Framing headers are always
//! recomputed, so whatever `Content-Length` or `Transfer-Encoding` the
//! response carried from an earlier hop is never trusted.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// Status, headers and a fully buffered body.
///
/// # Examples
///
/// ```
/// use cacheproxy::http::{Response, StatusCode};
///
/// let wire = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .header("Content-Length", "999")
///     .body(r#"{"pong":true}"#)
///     .into_bytes();
///
/// let text = std::str::from_utf8(&wire).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 13\r\n"));
/// assert!(!text.contains("999"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Adds a header; repeated names keep every value.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a header without consuming the response, for middleware that
    /// decorates what the rest of the chain returned.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets a binary body. Recorded and replayed bodies are passed as
    /// [`Bytes`] and are not copied.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the client connection stays open after this response.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, Headers, Bytes) {
        (self.status, self.headers, self.body)
    }

    /// Frames the response as HTTP/1.1.
    ///
    /// Headers are written in recorded order with the hop's own framing
    /// replacing any stale copy: `Connection` reflects
    /// [`keep_alive`](Self::keep_alive) and `Content-Length` comes last.
    /// No `Content-Type` is invented, so a replayed response looks exactly
    /// like the recorded one.
    pub fn into_bytes(mut self) -> BytesMut {
        self.headers.remove("content-length");
        self.headers.remove("transfer-encoding");
        self.headers.set(
            "Connection",
            if self.keep_alive { "keep-alive" } else { "close" },
        );

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + self.body.len());
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        buf.put(self.body);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(response: Response) -> String {
        String::from_utf8_lossy(&response.into_bytes()).into_owned()
    }

    #[test]
    fn frames_body_with_content_length_last() {
        let s = wire(
            Response::new(StatusCode::OK)
                .header("X-Cache", "HIT")
                .body("Hello"),
        );
        assert!(s.starts_with("HTTP/1.1 200 OK\r\nX-Cache: HIT\r\n"));
        assert!(s.ends_with("Content-Length: 5\r\n\r\nHello"));
    }

    #[test]
    fn stale_framing_headers_are_replaced() {
        let s = wire(
            Response::new(StatusCode::OK)
                .header("Content-Length", "999")
                .header("Transfer-Encoding", "chunked")
                .header("Connection", "close")
                .body("ok"),
        );
        assert!(!s.contains("999"));
        assert!(!s.contains("chunked"));
        assert_eq!(s.matches("Connection:").count(), 1);
        assert!(s.contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn replayed_body_gets_no_invented_content_type() {
        let s = wire(Response::new(StatusCode::OK).body_bytes(Bytes::from_static(b"\x1f\x8b")));
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn repeated_headers_keep_every_value() {
        let s = wire(
            Response::new(StatusCode::NO_CONTENT)
                .header("Vary", "Accept")
                .header("Vary", "Origin"),
        );
        assert!(s.contains("Vary: Accept\r\nVary: Origin\r\n"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn unregistered_status_is_still_written() {
        let s = wire(Response::new(StatusCode::from_u16(418)).keep_alive(false));
        assert!(s.starts_with("HTTP/1.1 418 \r\n"));
        assert!(s.contains("Connection: close\r\n"));
    }
}
