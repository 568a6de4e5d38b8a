//! Proxy configuration.
//!
//! [`ProxyConfig`] is a plain value; [`cli::CliArgs`] fills it from flags and
//! environment variables. Nothing is checked until [`ProxyConfig::validate`],
//! which the proxy calls during construction.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::cache::{CacheConfig, CacheError};
use crate::upstream::UpstreamError;

pub mod cli;

pub use cli::CliArgs;

/// Bytes per configured megabyte of cache budget.
pub const BYTES_PER_MB: u64 = 1_000_000;

/// Errors raised when validating a [`ProxyConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid target URL {url:?}: {source}")]
    InvalidTargetUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported target URL scheme {0:?}: only http and https are supported")]
    UnsupportedScheme(String),

    #[error("target URL {0:?} has no host")]
    MissingHost(String),

    #[error("{field} must be greater than zero")]
    InvalidSize { field: &'static str },

    #[error("invalid cache configuration: {0}")]
    Cache(#[from] CacheError),

    #[error("invalid upstream configuration: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Everything needed to construct a [`Proxy`](crate::proxy::Proxy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Absolute `http://` or `https://` URL of the origin. A path or query on it is
    /// prepended to every forwarded request.
    pub target_url: String,
    /// Expected number of cached responses; sizes the frequency sketch.
    pub expected_items: usize,
    /// Keep cache counters and log them on every request.
    pub record_metrics: bool,
    /// Budget for the summed size of cached responses, in bytes.
    pub max_cache_bytes: u64,
    /// Bound on a whole upstream exchange.
    pub upstream_timeout: Duration,
}

impl ProxyConfig {
    pub const DEFAULT_MAX_CACHE_MB: u64 = 100;
    pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

    /// A configuration with default cache budget and timeout and metrics off.
    pub fn new(target_url: impl Into<String>, expected_items: usize) -> Self {
        Self {
            target_url: target_url.into(),
            expected_items,
            record_metrics: false,
            max_cache_bytes: Self::DEFAULT_MAX_CACHE_MB * BYTES_PER_MB,
            upstream_timeout: Self::DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    /// Checks the configuration and returns the parsed target URL.
    ///
    /// # Errors
    ///
    /// A [`ConfigError`] naming the first problem found.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.target_url).map_err(|source| ConfigError::InvalidTargetUrl {
            url: self.target_url.clone(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_owned()));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingHost(self.target_url.clone()));
        }
        if self.expected_items == 0 {
            return Err(ConfigError::InvalidSize {
                field: "expected_items",
            });
        }
        if self.max_cache_bytes == 0 {
            return Err(ConfigError::InvalidSize {
                field: "max_cache_bytes",
            });
        }
        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::InvalidSize {
                field: "upstream_timeout",
            });
        }
        Ok(url)
    }

    /// The cache sizing implied by this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            expected_items: self.expected_items,
            max_cost: self.max_cache_bytes,
            metrics: self.record_metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProxyConfig::new("http://origin:8080", 1000);
        assert_eq!(config.max_cache_bytes, 100_000_000);
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
        assert!(!config.record_metrics);
        assert_eq!(config.validate().unwrap().port(), Some(8080));
    }

    #[test]
    fn rejects_bad_urls() {
        let err = ProxyConfig::new("not a url", 1).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTargetUrl { .. }));

        let url = ProxyConfig::new("https://origin/api", 1).validate().unwrap();
        assert_eq!(url.port_or_known_default(), Some(443));

        let err = ProxyConfig::new("ftp://origin", 1).validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(s) if s == "ftp"));

        let err = ProxyConfig::new("http://", 1).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidTargetUrl { .. } | ConfigError::MissingHost(_)
        ));
    }

    #[test]
    fn rejects_zero_sizes() {
        let err = ProxyConfig::new("http://origin", 0).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSize { field: "expected_items" }));

        let mut config = ProxyConfig::new("http://origin", 10);
        config.max_cache_bytes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSize { field: "max_cache_bytes" })
        ));

        config.max_cache_bytes = 1;
        config.upstream_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSize { field: "upstream_timeout" })
        ));
    }

    #[test]
    fn cache_config_carries_sizes() {
        let mut config = ProxyConfig::new("http://origin", 64);
        config.record_metrics = true;
        config.max_cache_bytes = 2048;
        assert_eq!(
            config.cache_config(),
            CacheConfig {
                expected_items: 64,
                max_cost: 2048,
                metrics: true,
            }
        );
    }
}
