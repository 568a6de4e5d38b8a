//! Round-trip execution strategies.
//!
//! A [`RoundTrip`] turns a [`Request`] into a [`Response`]. The proxy
//! dispatcher is written against this trait; the two implementations are
//! [`HttpTransport`](crate::upstream::HttpTransport), which talks to the
//! origin, and [`CachingTransport`], which wraps another transport and
//! answers opted-in requests from a [`BoundedCache`] when it can.
//!
//! ## Caching flow
//!
//! ```text
//! X-Cache absent/false/unparsable, or HEAD ─► inner transport ─► response
//! X-Cache true ─► fingerprint ─► cache hit  ─► decode stored bytes ─► response
//!                             └► cache miss ─► inner transport ─► encode
//!                                            ─► offer to cache ─► decode ─► response
//! ```
//!
//! On a miss the caller receives a response decoded from the freshly
//! encoded bytes, never the live upstream object, so hits and misses hand
//! back structurally identical values.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::BoundedCache;
use crate::fingerprint::{self, FingerprintError};
use crate::http::response::ResponseError;
use crate::http::{Headers, Method, Request, Response};
use crate::upstream::UpstreamError;

/// Header carrying the per-request caching opt-in.
pub const OPT_IN_HEADER: &str = "X-Cache";

/// A boxed, `Send` future, as returned by [`RoundTrip::round_trip`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by a round trip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not fingerprint request: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("cached response could not be decoded: {0}")]
    CorruptEntry(#[source] ResponseError),

    #[error("serialized upstream response could not be decoded: {0}")]
    Reencode(#[source] ResponseError),
}

/// Executes a single HTTP exchange.
///
/// # Contract
///
/// - Implementations are shared across Tokio tasks and must be `Send + Sync`.
/// - A returned `Ok` response is complete; partial bodies are errors.
pub trait RoundTrip: Send + Sync {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>>;
}

impl<T: RoundTrip + ?Sized> RoundTrip for Arc<T> {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        (**self).round_trip(request)
    }
}

/// The parsed state of the opt-in header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptIn {
    /// No opt-in header was sent.
    Absent,
    /// The header parsed as `true`.
    Enabled,
    /// The header parsed as `false`.
    Disabled,
    /// The header was present but is not a boolean; treated as [`Disabled`](Self::Disabled).
    Invalid(String),
}

impl OptIn {
    /// Reads the opt-in header from a request's headers.
    pub fn from_headers(headers: &Headers) -> Self {
        match headers.get(OPT_IN_HEADER) {
            None => Self::Absent,
            Some(raw) => match parse_bool(raw) {
                Some(true) => Self::Enabled,
                Some(false) => Self::Disabled,
                None => Self::Invalid(raw.to_owned()),
            },
        }
    }

    /// Only an explicit, well-formed `true` enables caching.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Parses the boolean spellings `1 t T TRUE true True` and
/// `0 f F FALSE false False`; anything else is `None`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// A [`RoundTrip`] that serves opted-in requests from a shared cache.
pub struct CachingTransport<T> {
    cache: Arc<BoundedCache>,
    inner: T,
}

impl<T: RoundTrip> CachingTransport<T> {
    /// Wraps `inner`, storing responses in `cache`.
    pub fn new(cache: Arc<BoundedCache>, inner: T) -> Self {
        Self { cache, inner }
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> &Arc<BoundedCache> {
        &self.cache
    }

    async fn cached_round_trip(&self, mut request: Request) -> Result<Response, TransportError> {
        let key = fingerprint::fingerprint(&mut request).await?;
        let method = request.method().clone();

        if let Some(stored) = self.cache.get(key.as_bytes()) {
            debug!(uri = %request.target(), bytes = stored.len(), "cache hit");
            return Response::decode(&stored, &method).map_err(TransportError::CorruptEntry);
        }

        debug!(uri = %request.target(), "cache miss");
        let uri = request.target().to_owned();
        let response = self.inner.round_trip(request).await?;

        let encoded = response.encode();
        if !self.cache.set(key.into_bytes(), encoded.clone()) {
            warn!(%uri, bytes = encoded.len(), "response not admitted to cache");
        }

        Response::decode(&encoded, &method).map_err(TransportError::Reencode)
    }
}

impl<T: RoundTrip> RoundTrip for CachingTransport<T> {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(async move {
            match OptIn::from_headers(request.headers()) {
                // A HEAD entry has no body and would poison the GET sharing its key.
                OptIn::Enabled if *request.method() == Method::Head => {
                    self.inner.round_trip(request).await
                }
                OptIn::Enabled => self.cached_round_trip(request).await,
                OptIn::Invalid(raw) => {
                    debug!(value = %raw, "unparsable {OPT_IN_HEADER} header; not caching");
                    self.inner.round_trip(request).await
                }
                OptIn::Absent | OptIn::Disabled => self.inner.round_trip(request).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::http::StatusCode;

    /// Upstream stand-in that counts calls and echoes the request body.
    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
        fail: bool,
    }

    impl RoundTrip for Echo {
        fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.fail {
                    return Err(UpstreamError::Timeout.into());
                }
                let body = request.body().as_bytes().cloned().unwrap_or_default();
                Ok(Response::new(StatusCode::OK)
                    .header("X-Call", n.to_string())
                    .header("Content-Length", body.len().to_string())
                    .body(body))
            })
        }
    }

    fn transport(max_cost: u64) -> CachingTransport<Echo> {
        let cache = BoundedCache::new(CacheConfig {
            expected_items: 16,
            max_cost,
            metrics: true,
        })
        .unwrap();
        CachingTransport::new(Arc::new(cache), Echo::default())
    }

    fn request(opt_in: Option<&str>, body: &'static str) -> Request {
        let req = Request::new(Method::Post, "/echo").with_body(body);
        match opt_in {
            Some(v) => req.header(OPT_IN_HEADER, v),
            None => req,
        }
    }

    #[test]
    fn opt_in_parsing() {
        let mut h = Headers::new();
        assert_eq!(OptIn::from_headers(&h), OptIn::Absent);
        h.set(OPT_IN_HEADER, "True");
        assert_eq!(OptIn::from_headers(&h), OptIn::Enabled);
        h.set(OPT_IN_HEADER, "0");
        assert_eq!(OptIn::from_headers(&h), OptIn::Disabled);
        h.set(OPT_IN_HEADER, "yes");
        assert_eq!(OptIn::from_headers(&h), OptIn::Invalid("yes".into()));
        assert!(!OptIn::Invalid("yes".into()).is_enabled());
    }

    #[test]
    fn bool_spellings() {
        for raw in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        for raw in ["", "yes", "tRuE", " true", "2"] {
            assert_eq!(parse_bool(raw), None, "{raw:?}");
        }
    }

    #[tokio::test]
    async fn second_opted_in_request_is_served_from_cache() {
        let t = transport(10_000);
        let first = t.round_trip(request(Some("true"), "ping")).await.unwrap();
        let second = t.round_trip(request(Some("true"), "ping")).await.unwrap();

        assert_eq!(t.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first.headers().get("x-call"), Some("1"));
        assert_eq!(&second.payload()[..], b"ping");
        assert_eq!(t.cache().metrics().hits, 1);
    }

    #[tokio::test]
    async fn different_bodies_are_different_entries() {
        let t = transport(10_000);
        t.round_trip(request(Some("1"), "a")).await.unwrap();
        let other = t.round_trip(request(Some("1"), "b")).await.unwrap();
        assert_eq!(t.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(&other.payload()[..], b"b");
    }

    #[tokio::test]
    async fn passthrough_never_touches_cache() {
        let t = transport(10_000);
        for opt_in in [None, Some("false"), Some("nope"), None, Some("0")] {
            t.round_trip(request(opt_in, "same")).await.unwrap();
        }
        assert_eq!(t.inner.calls.load(Ordering::SeqCst), 5);
        let m = t.cache().metrics();
        assert_eq!((m.hits, m.misses, m.keys_added), (0, 0, 0));
        assert!(t.cache().is_empty());
    }

    #[tokio::test]
    async fn head_requests_bypass_cache() {
        let t = transport(10_000);
        for _ in 0..2 {
            let req = Request::new(Method::Head, "/echo").header(OPT_IN_HEADER, "true");
            t.round_trip(req).await.unwrap();
        }
        assert_eq!(t.inner.calls.load(Ordering::SeqCst), 2);
        assert!(t.cache().is_empty());
    }

    #[tokio::test]
    async fn rejected_insert_still_returns_response() {
        let t = transport(8);
        let response = t
            .round_trip(request(Some("true"), "far too large for the budget"))
            .await
            .unwrap();
        assert_eq!(&response.payload()[..], b"far too large for the budget");
        assert!(t.cache().is_empty());
        assert_eq!(t.cache().metrics().sets_rejected, 1);
    }

    #[tokio::test]
    async fn upstream_failure_is_not_cached() {
        let cache = Arc::new(
            BoundedCache::new(CacheConfig {
                expected_items: 4,
                max_cost: 1000,
                metrics: true,
            })
            .unwrap(),
        );
        let t = CachingTransport::new(
            Arc::clone(&cache),
            Echo {
                fail: true,
                ..Default::default()
            },
        );
        let err = t.round_trip(request(Some("true"), "x")).await.unwrap_err();
        assert!(matches!(err, TransportError::Upstream(UpstreamError::Timeout)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn corrupt_entry_is_an_error() {
        let t = transport(10_000);
        let mut lookup = request(Some("true"), "body");
        let key = fingerprint::fingerprint(&mut lookup).await.unwrap();
        t.cache()
            .set(key.into_bytes(), Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 99\r\n\r\nshort"));

        let err = t.round_trip(request(Some("true"), "body")).await.unwrap_err();
        assert!(matches!(err, TransportError::CorruptEntry(_)));
        assert_eq!(t.inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_multipart_surfaces_error() {
        let t = transport(10_000);
        let req = Request::new(Method::Post, "/upload")
            .header(OPT_IN_HEADER, "true")
            .header("Content-Type", "multipart/form-data; boundary=q")
            .with_body("garbage");
        let err = t.round_trip(req).await.unwrap_err();
        assert!(matches!(err, TransportError::Fingerprint(_)));
        assert_eq!(t.inner.calls.load(Ordering::SeqCst), 0);
    }
}
