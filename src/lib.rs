//! # cacheproxy
//!
//! A transparent response cache for POST-style HTTP APIs (GraphQL and the
//! like), built on a from-scratch async HTTP/1.1 server.
//!
//! Requests are keyed by `<namespace>:<sha256(body)>`. A hit replays the
//! stored response; a miss streams the backend's response to the client while
//! recording it, and stores it when its `Cache-Control` lifetime allows.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cacheproxy::cache::{CacheConfig, CacheLayer, MemoryStore};
//! use cacheproxy::proxy::ProxyBackend;
//! use cacheproxy::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layer = CacheLayer::new(Arc::new(MemoryStore::new()), CacheConfig::default());
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run_cached(layer, ProxyBackend::new("127.0.0.1:4000")).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;
pub mod proxy;
pub mod server;

pub use cache::{CacheConfig, CacheKey, CacheLayer, CacheStore, MemoryStore, Outcome, RedisStore};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{ProxyBackend, ProxyError};
pub use server::{Server, ServerError};
