//! Failures on the cache path.
//!
//! None of these ever reach the client: a store failure falls through to the
//! backend and a codec failure either reads as a miss or skips the write.

use thiserror::Error;

/// The key-value store could not be reached or answered with an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid store address {0:?}")]
    InvalidUrl(String),
}

/// A cached entry could not be produced or read back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to compress body: {0}")]
    Compress(#[source] std::io::Error),

    #[error("failed to decompress body: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("failed to encode entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed entry: {0}")]
    Decode(#[source] serde_json::Error),
}
