//! Forward-while-recording response sink.
//!
//! [`CaptureWriter`] wraps the client's [`ResponseWriter`]. Everything the
//! backend writes goes through to the client unchanged and in order, and a
//! copy is kept so the cache layer can decide afterwards whether to store it.

use std::time::Instant;

use bytes::BytesMut;

use crate::http::{Headers, ResponseWriter, StatusCode};

pub const X_CACHE: &str = "X-Cache";
pub const X_SERVER: &str = "X-Server";
pub const X_ELAPSED: &str = "X-Elapsed";

/// Sets the three diagnostic headers on `headers`.
pub(crate) fn stamp(headers: &mut Headers, cache_status: &str, server: &str, started: Instant) {
    headers.set(X_CACHE, cache_status);
    headers.set(X_SERVER, server);
    headers.set(X_ELAPSED, format!("{}ms", started.elapsed().as_millis()));
}

/// What the backend produced, as seen through a [`CaptureWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub status: StatusCode,
    /// Headers as written by the backend, without the diagnostic headers.
    pub headers: Headers,
    pub body: BytesMut,
}

/// Response sink decorator for the miss path.
///
/// Header fields the backend sets are buffered and flushed to the client once,
/// together with `X-Cache: MISS`, `X-Server` and `X-Elapsed`, when the first
/// final (`2xx`+) status is written or the first body byte arrives. Interim
/// `1xx` statuses pass straight through and may repeat.
pub struct CaptureWriter<'w> {
    inner: &'w mut dyn ResponseWriter,
    server: &'w str,
    started: Instant,
    headers: Headers,
    status: Option<StatusCode>,
    body: BytesMut,
    flushed: bool,
}

impl<'w> CaptureWriter<'w> {
    /// `started` is when the request entered the cache layer; `X-Elapsed` is
    /// measured from it.
    pub fn new(inner: &'w mut dyn ResponseWriter, server: &'w str, started: Instant) -> Self {
        Self {
            inner,
            server,
            started,
            headers: Headers::new(),
            status: None,
            body: BytesMut::new(),
            flushed: false,
        }
    }

    /// Whether headers have been sent to the client.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Flushes headers if the backend never did and returns the recording.
    ///
    /// A backend that wrote nothing produced an empty `200 OK`.
    pub fn finish(mut self) -> Captured {
        if !self.flushed {
            self.write_header(StatusCode::OK);
        }
        Captured {
            status: self.status.unwrap_or(StatusCode::OK),
            headers: self.headers,
            body: self.body,
        }
    }

    fn flush(&mut self, status: StatusCode) {
        let client = self.inner.headers_mut();
        for (name, value) in self.headers.iter() {
            client.insert(name, value);
        }
        stamp(client, "MISS", self.server, self.started);
        self.inner.write_header(status);
        self.flushed = true;
    }
}

impl ResponseWriter for CaptureWriter<'_> {
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if status.is_informational() {
            self.inner.write_header(status);
            return;
        }
        if self.flushed {
            return;
        }
        self.status = Some(status);
        self.flush(status);
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if !self.flushed {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
        self.inner.write(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseBuffer;

    #[test]
    fn forwards_and_records() {
        let mut client = ResponseBuffer::new();
        let mut capture = CaptureWriter::new(&mut client, "cacheproxy", Instant::now());

        capture.headers_mut().insert("Cache-Control", "max-age=30");
        capture.write_header(StatusCode::OK);
        capture.write(b"{\"pong\":");
        capture.write(b"true}");
        let captured = capture.finish();

        assert_eq!(captured.status, StatusCode::OK);
        assert_eq!(captured.body.as_ref(), br#"{"pong":true}"#);
        assert_eq!(captured.headers.get("cache-control"), Some("max-age=30"));
        assert!(!captured.headers.contains(X_CACHE));

        let response = client.into_response();
        assert_eq!(response.content(), br#"{"pong":true}"#);
        assert_eq!(response.headers().get("cache-control"), Some("max-age=30"));
        assert_eq!(response.headers().get("x-cache"), Some("MISS"));
        assert_eq!(response.headers().get("x-server"), Some("cacheproxy"));
        assert!(response.headers().get("x-elapsed").unwrap().ends_with("ms"));
    }

    #[test]
    fn headers_flush_once() {
        let mut client = ResponseBuffer::new();
        let mut capture = CaptureWriter::new(&mut client, "cacheproxy", Instant::now());

        capture.headers_mut().insert("X-One", "1");
        capture.write_header(StatusCode::OK);
        capture.headers_mut().insert("X-Two", "2");
        capture.write_header(StatusCode::INTERNAL_SERVER_ERROR);
        let captured = capture.finish();

        assert_eq!(captured.status, StatusCode::OK);
        let response = client.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get_all("x-cache").count(), 1);
        assert_eq!(response.headers().get_all("x-one").count(), 1);
        assert!(!response.headers().contains("x-two"));
    }

    #[test]
    fn informational_statuses_pass_through_without_flushing() {
        let mut client = ResponseBuffer::new();
        let mut capture = CaptureWriter::new(&mut client, "cacheproxy", Instant::now());

        capture.write_header(StatusCode::CONTINUE);
        capture.write_header(StatusCode::CONTINUE);
        assert!(!capture.is_flushed());
        capture.headers_mut().insert("Cache-Control", "max-age=5");
        capture.write_header(StatusCode::NOT_FOUND);
        assert!(capture.is_flushed());
        let captured = capture.finish();

        assert_eq!(captured.status, StatusCode::NOT_FOUND);
        assert_eq!(client.informational(), &[StatusCode::CONTINUE, StatusCode::CONTINUE]);
        let response = client.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("cache-control"), Some("max-age=5"));
    }

    #[test]
    fn body_without_status_commits_ok() {
        let mut client = ResponseBuffer::new();
        let mut capture = CaptureWriter::new(&mut client, "edge", Instant::now());
        capture.write(b"data");
        let captured = capture.finish();
        assert_eq!(captured.status, StatusCode::OK);
        assert_eq!(client.into_response().headers().get("x-server"), Some("edge"));
    }

    #[test]
    fn silent_backend_still_gets_diagnostics() {
        let mut client = ResponseBuffer::new();
        let capture = CaptureWriter::new(&mut client, "cacheproxy", Instant::now());
        let captured = capture.finish();
        assert!(captured.body.is_empty());
        let response = client.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-cache"), Some("MISS"));
    }
}
