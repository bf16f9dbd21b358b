//! The response sink contract backends write into.
//!
//! A backend sets header fields, commits a status with
//! [`ResponseWriter::write_header`], then streams body chunks with
//! [`ResponseWriter::write`]. Writing body bytes before a status commits an
//! implicit `200 OK`. Header changes made after the status is committed are
//! not sent.
//!
//! [`ResponseBuffer`] is the sink at the client edge: it assembles what was
//! written into a [`Response`] that the server serializes onto the socket.

use bytes::BytesMut;
use tracing::debug;

use super::{Headers, Response, StatusCode};

/// Write half of an HTTP exchange.
///
/// Implementations must be `Send` because a backend holds the writer across
/// `.await` points.
pub trait ResponseWriter: Send {
    /// Header fields that will be sent with the next final status.
    fn headers_mut(&mut self) -> &mut Headers;

    /// Commits a status. `1xx` statuses are interim and may be written any
    /// number of times; the first `2xx`+ status is final and later ones are ignored.
    fn write_header(&mut self, status: StatusCode);

    /// Appends body bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> usize;
}

/// Copies a complete [`Response`] into `writer`: headers, status, then body.
pub fn write_response(writer: &mut dyn ResponseWriter, response: Response) {
    let (status, headers, body) = response.into_parts();
    let sink = writer.headers_mut();
    for (name, value) in headers.iter() {
        sink.insert(name, value);
    }
    writer.write_header(status);
    if !body.is_empty() {
        writer.write(&body);
    }
}

/// In-memory client sink.
///
/// # Examples
///
/// ```
/// use cacheproxy::http::{ResponseBuffer, ResponseWriter, StatusCode};
///
/// let mut sink = ResponseBuffer::new();
/// sink.headers_mut().insert("Content-Type", "application/json");
/// sink.write(b"{}");
///
/// let response = sink.into_response();
/// assert_eq!(response.status(), StatusCode::OK);
/// assert_eq!(response.content(), b"{}");
/// ```
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    headers: Headers,
    committed: Option<(StatusCode, Headers)>,
    informational: Vec<StatusCode>,
    body: BytesMut,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interim `1xx` statuses written so far, in order.
    pub fn informational(&self) -> &[StatusCode] {
        &self.informational
    }

    /// The final status, once committed.
    pub fn status(&self) -> Option<StatusCode> {
        self.committed.as_ref().map(|(status, _)| *status)
    }

    /// Assembles the final response. A sink nobody wrote to yields an empty `200 OK`.
    pub fn into_response(self) -> Response {
        let (status, headers) = self
            .committed
            .unwrap_or((StatusCode::OK, self.headers));

        let mut response = Response::new(status);
        for (name, value) in headers.iter() {
            response.add_header(name, value);
        }
        response.body_bytes(self.body.freeze())
    }
}

impl ResponseWriter for ResponseBuffer {
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if status.is_informational() {
            self.informational.push(status);
            return;
        }
        if let Some((committed, _)) = &self.committed {
            debug!(
                committed = committed.as_u16(),
                ignored = status.as_u16(),
                "superfluous write_header call"
            );
            return;
        }
        self.committed = Some((status, self.headers.clone()));
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if self.committed.is_none() {
            self.write_header(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
        data.len()
    }
}
