//! The reverse-proxy request handler.
//!
//! [`Proxy::handle`] is the single entry point the server calls for every
//! inbound request. It sanitises the request, points it at the configured
//! origin, runs it through the transport (which may answer from cache),
//! and stamps the response with [`TIMESTAMP_HEADER`]. Transport failures
//! become gateway error responses here; the client never sees a dropped
//! connection for an upstream problem.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};
use url::Url;

use crate::cache::BoundedCache;
use crate::config::{ConfigError, ProxyConfig};
use crate::http::{Headers, Request, Response, StatusCode};
use crate::transport::{CachingTransport, RoundTrip, TransportError};
use crate::upstream::{HttpTransport, UpstreamError};

/// Response header carrying the Unix time (seconds) at which the proxy
/// produced the response.
pub const TIMESTAMP_HEADER: &str = "X-Cache-Timestamp";

/// Connection-scoped headers that are never forwarded (RFC 9110 §7.6.1).
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A caching reverse proxy for a single origin.
pub struct Proxy<T = CachingTransport<HttpTransport>> {
    target: Url,
    cache: Arc<BoundedCache>,
    transport: T,
    record_metrics: bool,
}

impl Proxy {
    /// Builds the cache and upstream transport described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration does not validate.
    pub fn new(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let target = config.validate()?;
        let cache = Arc::new(BoundedCache::new(config.cache_config())?);
        let upstream = HttpTransport::new(&target, config.upstream_timeout)?;
        let transport = CachingTransport::new(Arc::clone(&cache), upstream);

        info!(
            origin = %target,
            max_cache_bytes = config.max_cache_bytes,
            expected_items = config.expected_items,
            record_metrics = config.record_metrics,
            "proxy configured"
        );

        Ok(Self::from_parts(target, cache, transport, config.record_metrics))
    }
}

impl<T: RoundTrip> Proxy<T> {
    /// Assembles a proxy from already-built parts. `cache` is only read
    /// for metrics; caching itself is up to `transport`.
    pub fn from_parts(target: Url, cache: Arc<BoundedCache>, transport: T, record_metrics: bool) -> Self {
        Self {
            target,
            cache,
            transport,
            record_metrics,
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn cache(&self) -> &Arc<BoundedCache> {
        &self.cache
    }

    /// Forwards `request` to the origin and returns the response to send
    /// back to the client.
    pub async fn handle(&self, mut request: Request) -> Response {
        request.headers_mut().remove("x-forwarded-for");

        if self.record_metrics {
            self.log_metrics();
        }

        let target = self.rewrite_target(request.target());
        request.set_target(target);
        strip_hop_by_hop(request.headers_mut());

        let method = request.method().clone();
        let uri = request.target().to_owned();

        let mut response = match self.transport.round_trip(request).await {
            Ok(response) => response,
            Err(err) => {
                let status = error_status(&err);
                warn!(%method, %uri, status = status.as_u16(), error = %err, "proxy request failed");
                Response::text(status, status.canonical_reason().unwrap_or_default())
            }
        };

        strip_hop_by_hop(response.headers_mut());
        response.add_header(
            TIMESTAMP_HEADER,
            OffsetDateTime::now_utc().unix_timestamp().to_string(),
        );
        response
    }

    fn log_metrics(&self) {
        match serde_json::to_string(&self.cache.metrics()) {
            Ok(metrics) => info!(%metrics, "cache metrics"),
            Err(e) => warn!(error = %e, "failed to serialize cache metrics"),
        }
    }

    /// Maps an inbound origin-form target onto the configured origin: the
    /// paths are joined with exactly one slash and the queries with `&`.
    fn rewrite_target(&self, inbound: &str) -> String {
        let (path, query) = match inbound.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (inbound, None),
        };

        let mut rewritten = join_paths(self.target.path(), path);
        let base_query = self.target.query().filter(|q| !q.is_empty());
        match (base_query, query.filter(|q| !q.is_empty())) {
            (Some(base), Some(query)) => {
                rewritten.push('?');
                rewritten.push_str(base);
                rewritten.push('&');
                rewritten.push_str(query);
            }
            (Some(query), None) | (None, Some(query)) => {
                rewritten.push('?');
                rewritten.push_str(query);
            }
            (None, None) => {}
        }
        rewritten
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn error_status(err: &TransportError) -> StatusCode {
    match err {
        TransportError::Fingerprint(_) => StatusCode::BAD_REQUEST,
        TransportError::Upstream(UpstreamError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Removes the fixed hop-by-hop headers plus any header listed in
/// `Connection`.
fn strip_hop_by_hop(headers: &mut Headers) {
    let named: Vec<String> = headers
        .get_all("connection")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();

    for name in named.iter().map(String::as_str).chain(HOP_BY_HOP) {
        headers.remove(name);
    }
}
