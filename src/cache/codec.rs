//! Persisted form of a captured response.
//!
//! An entry is a JSON record:
//!
//! ```text
//! {"method":"POST","status":200,"body":"<base64 of gzip(body)>","headers":{"Name":["v1","v2"]}}
//! ```
//!
//! The stored body is always gzip-compressed exactly once, whatever the
//! backend's own `Content-Encoding` was. Records written by older versions use
//! `Method`/`Status` keys and may omit the status or carry `0`; both read as
//! "no status".

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Deserializer, Serialize};

use crate::http::{Headers, StatusCode};

use super::error::CodecError;

/// Headers tied to a single hop or encoding; never persisted, never replayed.
pub const TRANSPORT_HEADERS: [&str; 5] = [
    "Content-Length",
    "Transfer-Encoding",
    "Content-Encoding",
    "Connection",
    "Date",
];

pub fn is_transport_header(name: &str) -> bool {
    TRANSPORT_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

pub fn strip_transport_headers(headers: &mut Headers) {
    headers.retain_names(|name| !is_transport_header(name));
}

/// A response as captured from the backend or read back from the store.
///
/// `body` is always the logical, uncompressed payload at this boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEnvelope {
    /// Method of the request that produced this response.
    pub method: String,
    /// Absent on entries written before statuses were recorded.
    pub status: Option<StatusCode>,
    pub headers: Headers,
    pub body: Bytes,
}

impl ResponseEnvelope {
    /// The status to replay; legacy entries without one replay as `200 OK`.
    pub fn status_or_ok(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }
}

#[derive(Serialize)]
struct EntryOut<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    body: String,
    headers: &'a Headers,
}

#[derive(Deserialize)]
struct EntryIn {
    #[serde(default, alias = "Method")]
    method: String,
    #[serde(default, alias = "Status")]
    status: Option<u16>,
    #[serde(default, deserialize_with = "base64_bytes")]
    body: Vec<u8>,
    #[serde(default)]
    headers: Option<Headers>,
}

fn base64_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Serializes `envelope` for storage.
///
/// Transport-only headers are dropped here and nowhere else on the write path.
/// A body the backend sent as `Content-Encoding: gzip` is inflated first so the
/// record never holds a doubly-compressed payload.
///
/// # Errors
///
/// [`CodecError`] when compression or JSON encoding fails. Callers skip the
/// cache write; the client already has its response.
pub fn encode(envelope: &ResponseEnvelope) -> Result<Vec<u8>, CodecError> {
    let already_gzipped = envelope
        .headers
        .get_all("content-encoding")
        .any(|v| v.to_ascii_lowercase().contains("gzip"));

    let compressed = if already_gzipped {
        let plain = gunzip(&envelope.body).map_err(CodecError::Decompress)?;
        gzip(&plain)
    } else {
        gzip(&envelope.body)
    }
    .map_err(CodecError::Compress)?;

    let mut headers = envelope.headers.clone();
    strip_transport_headers(&mut headers);

    let entry = EntryOut {
        method: &envelope.method,
        status: envelope.status.map(StatusCode::as_u16),
        body: STANDARD.encode(compressed),
        headers: &headers,
    };
    serde_json::to_vec(&entry).map_err(CodecError::Encode)
}

/// Reads back an entry produced by [`encode`] (or an older writer).
///
/// # Errors
///
/// [`CodecError`] on malformed JSON, bad base64 or a body that does not
/// inflate. Callers treat this as a corrupt entry, i.e. a miss.
pub fn decode(data: &[u8]) -> Result<ResponseEnvelope, CodecError> {
    let entry: EntryIn = serde_json::from_slice(data).map_err(CodecError::Decode)?;
    let body = gunzip(&entry.body).map_err(CodecError::Decompress)?;

    Ok(ResponseEnvelope {
        method: entry.method,
        status: entry
            .status
            .filter(|code| *code != 0)
            .map(StatusCode::from_u16),
        headers: entry.headers.unwrap_or_default(),
        body: Bytes::from(body),
    })
}
