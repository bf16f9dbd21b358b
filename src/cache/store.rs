//! Key-value stores holding serialized entries.
//!
//! The cache layer only needs "set with expiry" and "get before expiry".
//! Implementations handle their own concurrency; the layer issues independent
//! calls and never locks or does read-modify-write on top of them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::error::StoreError;

/// Boxed, `Send` future returned by store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage backend for cache entries.
///
/// # Contract
///
/// - `get` returns `Ok(None)` for an absent or expired key; `Err` only when the
///   store itself could not answer.
/// - A value `set` with a TTL is returned by `get` until the TTL elapses or the
///   store evicts it.
pub trait CacheStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

struct Slot {
    value: Bytes,
    // `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local store with per-entry expiry.
///
/// Expired entries read as absent. They are dropped when read, and every
/// `set` sweeps the rest, so keys that are never requested again do not
/// accumulate.
#[derive(Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CacheStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        Box::pin(async move {
            let now = Instant::now();
            {
                let slots = self.slots.read().await;
                match slots.get(key) {
                    None => return Ok(None),
                    Some(slot) if slot.is_live(now) => return Ok(Some(slot.value.clone())),
                    Some(_) => {}
                }
            }

            let mut slots = self.slots.write().await;
            if slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
                slots.remove(key);
                debug!(key, "evicted expired entry");
            }
            Ok(None)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let now = Instant::now();
            let slot = Slot {
                value,
                expires_at: now.checked_add(ttl),
            };

            let mut slots = self.slots.write().await;
            let before = slots.len();
            slots.retain(|_, existing| existing.is_live(now));
            if slots.len() < before {
                debug!(evicted = before - slots.len(), "swept expired entries");
            }
            slots.insert(key.to_owned(), slot);
            Ok(())
        })
    }
}

/// Redis-backed store.
///
/// Uses a [`ConnectionManager`], which multiplexes one connection across
/// concurrent callers and reconnects after failures.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub const DEFAULT_ADDR: &'static str = "redis:6379";
    pub const DEFAULT_DATABASE: i64 = 6;

    /// Connects and verifies the server answers `PING`.
    ///
    /// `addr` is `host:port`, `tls://host:port` (TLS without certificate
    /// verification) or a full `redis://`/`rediss://` URL, which is used as-is
    /// and ignores `database`.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidUrl`] for an empty address, otherwise
    /// [`StoreError::Redis`] or [`StoreError::Unavailable`] when the server
    /// cannot be reached.
    pub async fn connect(addr: &str, database: i64) -> Result<Self, StoreError> {
        let url = connection_url(addr, database)?;
        let client = redis::Client::open(url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("ping failed: {e}")))?;
        debug!(reply = %pong, "redis ping");
        info!(addr, database, "connected to redis");

        Ok(Self { conn })
    }
}

impl CacheStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = conn.get(key).await?;
            Ok(value.map(Bytes::from))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // EX 0 is rejected by redis.
            let seconds = ttl.as_secs().max(1);
            let _: () = conn.set_ex(key, value.as_ref(), seconds).await?;
            Ok(())
        })
    }
}

fn connection_url(addr: &str, database: i64) -> Result<String, StoreError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(StoreError::InvalidUrl(addr.to_owned()));
    }
    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        return Ok(addr.to_owned());
    }
    match addr.strip_prefix("tls://") {
        Some("") => Err(StoreError::InvalidUrl(addr.to_owned())),
        Some(host) => Ok(format!("rediss://{host}/{database}#insecure")),
        None => Ok(format!("redis://{addr}/{database}")),
    }
}
