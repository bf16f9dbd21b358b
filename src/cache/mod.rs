//! Caching layer: content-addressed response cache in front of a backend.
//!
//! A request's cache key is the SHA-256 of its body, prefixed with a namespace
//! taken from the `store` request header (or `default`). On a hit the stored
//! response is replayed without touching the backend. On a miss the backend
//! runs behind a [`CaptureWriter`] that streams its output to the client while
//! keeping a copy, and the copy is stored when the [`policy`] allows it.
//!
//! ## Components
//!
//! - [`hash`]: [`fingerprint`] and [`CacheKey`].
//! - [`codec`]: [`ResponseEnvelope`] and its gzip-compressed JSON entry format.
//! - [`policy`]: [`ttl`](policy::ttl) and [`evaluate`](policy::evaluate).
//! - [`capture`]: [`CaptureWriter`], the forward-while-recording sink.
//! - [`store`]: the [`CacheStore`] trait, [`MemoryStore`] and [`RedisStore`].
//! - [`fsm`]: [`CacheLayer`], the per-request state machine.
//!
//! ## Diagnostic headers
//!
//! | Header      | Value                                |
//! |-------------|--------------------------------------|
//! | `X-Cache`   | `HIT` or `MISS`                      |
//! | `X-Server`  | [`CacheConfig::server_name`]         |
//! | `X-Elapsed` | `<n>ms` since the request arrived    |

pub mod backend;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod fsm;
pub mod hash;
pub mod policy;
pub mod store;

pub use backend::{Backend, ServiceFn, service_fn};
pub use capture::{CaptureWriter, Captured};
pub use codec::{ResponseEnvelope, TRANSPORT_HEADERS, decode, encode, gunzip, gzip};
pub use config::CacheConfig;
pub use error::{CodecError, StoreError};
pub use fsm::{CacheLayer, Outcome};
pub use hash::{CacheKey, fingerprint};
pub use policy::{Reason, Verdict};
pub use store::{BoxFuture, CacheStore, MemoryStore, RedisStore};
