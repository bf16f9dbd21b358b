//! Cache layer settings.

use serde::Deserialize;

/// Settings for a [`CacheLayer`](super::CacheLayer).
///
/// Deserializable so a host can load it from its own configuration source;
/// missing fields take their defaults.
///
/// | Setting             | Default        |
/// |---------------------|----------------|
/// | `namespace_header`  | `store`        |
/// | `default_namespace` | `default`      |
/// | `server_name`       | `cacheproxy`   |
///
/// # Examples
///
/// ```rust
/// use cacheproxy::cache::CacheConfig;
///
/// let config = CacheConfig::new()
///     .namespace_header("X-Cache-Namespace")
///     .server_name("edge-1");
/// assert_eq!(config.default_namespace, "default");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Request header whose value replaces the default key namespace.
    pub namespace_header: String,
    /// Namespace used when the request does not name one.
    pub default_namespace: String,
    /// Value of the `X-Server` diagnostic header.
    pub server_name: String,
}

impl CacheConfig {
    pub const DEFAULT_NAMESPACE_HEADER: &'static str = "store";
    pub const DEFAULT_NAMESPACE: &'static str = "default";
    pub const DEFAULT_SERVER_NAME: &'static str = "cacheproxy";

    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn namespace_header(mut self, header: impl Into<String>) -> Self {
        self.namespace_header = header.into();
        self
    }

    #[must_use]
    pub fn default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace_header: Self::DEFAULT_NAMESPACE_HEADER.to_string(),
            default_namespace: Self::DEFAULT_NAMESPACE.to_string(),
            server_name: Self::DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config: CacheConfig = serde_json::from_str(r#"{"server_name":"edge-7"}"#).unwrap();
        assert_eq!(config.server_name, "edge-7");
        assert_eq!(config.namespace_header, "store");
        assert_eq!(config.default_namespace, "default");
    }
}
