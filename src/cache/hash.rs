//! Cache key derivation.
//!
//! A key is `<namespace>:<sha256(body) as lowercase hex>`. Only the body and
//! the namespace take part: method, path and every other header are ignored.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::http::Request;

use super::config::CacheConfig;

/// SHA-256 of `body`, hex encoded.
///
/// # Examples
///
/// ```
/// use cacheproxy::cache::fingerprint;
///
/// assert_eq!(
///     fingerprint(b""),
///     "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
/// );
/// ```
pub fn fingerprint(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Namespace-qualified content fingerprint identifying one cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(namespace: &str, body: &[u8]) -> Self {
        Self(format!("{namespace}:{}", fingerprint(body)))
    }

    /// Derives the key for `request`, taking the namespace from the configured
    /// request header and falling back to the default namespace when the header
    /// is missing or blank.
    pub fn for_request(request: &Request, config: &CacheConfig) -> Self {
        let namespace = request
            .headers()
            .get(&config.namespace_header)
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(config.default_namespace.as_str());
        Self::new(namespace, request.body())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
