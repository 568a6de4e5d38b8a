//! # cacheproxy
//!
//! An opt-in, in-memory HTTP/1.1 caching reverse proxy.
//!
//! Every inbound request is forwarded to a single origin. Requests carrying
//! `X-Cache: true` are fingerprinted (target plus body, or target plus
//! multipart part payloads) and answered from a bounded in-memory cache
//! when an identical request has been seen before. Everything else passes
//! straight through. Every response is stamped with `X-Cache-Timestamp`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cacheproxy::{Proxy, ProxyConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = Arc::new(Proxy::new(&ProxyConfig::new("http://127.0.0.1:8080", 10_000))?);
//!     let server = Server::bind("127.0.0.1:4242").await?;
//!     server
//!         .run(move |req| {
//!             let proxy = Arc::clone(&proxy);
//!             async move { proxy.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod http;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{BoundedCache, CacheConfig, CacheError, MetricsSnapshot};
pub use config::{ConfigError, ProxyConfig};
pub use fingerprint::{Fingerprint, FingerprintError, fingerprint};
pub use http::{Body, Headers, Method, Request, Response, StatusCode};
pub use proxy::{Proxy, TIMESTAMP_HEADER};
pub use server::{Server, ServerError};
pub use transport::{CachingTransport, OPT_IN_HEADER, RoundTrip, TransportError};
pub use upstream::{HttpTransport, UpstreamError};
