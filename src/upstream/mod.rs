//! The origin-facing HTTP/1.1 client.
//!
//! [`HttpTransport`] speaks HTTP/1.1 to a single origin through
//! [`hyper::client::conn::http1`], over plain TCP for `http://` targets and
//! over TLS ([`tokio_rustls`], webpki roots) for `https://` targets.
//! Connections are kept alive and reused through a small idle pool.
//!
//! The request body is buffered and sent with a computed length. The
//! response body is read in full, up to a size limit, and whatever framing
//! the origin chose, the returned [`Response`] carries a `Content-Length`
//! header and no `Transfer-Encoding`, so its [`encode`](Response::encode)d
//! form is self-delimiting.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tracing::debug;
use url::{Host, Url};

use crate::http::{Method, Request, Response, StatusCode};
use crate::transport::{BoxFuture, RoundTrip, TransportError};

/// Errors talking to the origin.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unsupported upstream target {0:?}: only http:// and https:// URLs with a host are accepted")]
    InvalidTarget(String),

    #[error("failed to build TLS client configuration: {0}")]
    TlsConfig(#[source] rustls::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("HTTP handshake with upstream failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("failed to read request body: {0}")]
    RequestBody(#[source] io::Error),

    #[error("request cannot be forwarded: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("upstream exchange failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("failed to read upstream response body: {0}")]
    ResponseBody(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("upstream answered with invalid status {0}")]
    InvalidStatus(u16),

    #[error("upstream did not answer in time")]
    Timeout,

    #[error("upstream response exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

type Sender = http1::SendRequest<Full<Bytes>>;

/// TLS settings for an `https://` origin.
#[derive(Clone)]
struct Tls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl Tls {
    fn new(host: &Host<&str>) -> Result<Self, UpstreamError> {
        let server_name = match *host {
            Host::Domain(domain) => ServerName::try_from(domain.to_owned())
                .map_err(|_| UpstreamError::InvalidTarget(domain.to_owned()))?,
            Host::Ipv4(ip) => ServerName::from(IpAddr::V4(ip)),
            Host::Ipv6(ip) => ServerName::from(IpAddr::V6(ip)),
        };

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(UpstreamError::TlsConfig)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// A [`RoundTrip`] that forwards requests to a single origin.
///
/// Clones share the idle connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    /// `host:port` to connect to.
    addr: String,
    /// Value for a `Host` header when the inbound request carries none.
    authority: String,
    tls: Option<Tls>,
    timeout: Duration,
    max_response_bytes: usize,
    idle: Arc<Mutex<Vec<Sender>>>,
}

impl HttpTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Largest response body that will be buffered: 64 MiB.
    pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

    /// Idle keep-alive connections kept for reuse.
    pub const MAX_IDLE_CONNECTIONS: usize = 32;

    /// Creates a transport for the origin named by `target`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidTarget`] unless `target` is an
    /// `http://` or `https://` URL with a host.
    pub fn new(target: &Url, timeout: Duration) -> Result<Self, UpstreamError> {
        let invalid = || UpstreamError::InvalidTarget(target.to_string());
        let secure = match target.scheme() {
            "http" => false,
            "https" => true,
            _ => return Err(invalid()),
        };

        let host = target.host().ok_or_else(invalid)?;
        // `Host` displays IPv6 addresses in brackets.
        let host_name = host.to_string();
        let port = target
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });
        let authority = match target.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.clone(),
        };
        let tls = if secure { Some(Tls::new(&host)?) } else { None };

        Ok(Self {
            addr: format!("{host_name}:{port}"),
            authority,
            tls,
            timeout,
            max_response_bytes: Self::MAX_RESPONSE_BYTES,
            idle: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Overrides the response body size limit.
    #[must_use]
    pub fn max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    /// The `host:port` this transport connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether connections to the origin use TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Number of idle connections currently pooled.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Sends `request` and reads the complete response, bounded by the
    /// configured timeout.
    ///
    /// # Errors
    ///
    /// Any [`UpstreamError`]; a response is either complete or an error.
    pub async fn send(&self, request: Request) -> Result<Response, UpstreamError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| UpstreamError::Timeout)?
    }

    async fn exchange(&self, mut request: Request) -> Result<Response, UpstreamError> {
        let body = std::mem::take(request.body_mut())
            .collect()
            .await
            .map_err(UpstreamError::RequestBody)?;
        let method = request.method().clone();
        let outbound = self.outbound(&request, body)?;

        let (mut sender, reused) = self.checkout().await?;
        debug!(upstream = %self.addr, %method, uri = %request.target(), reused, "forwarding request");

        let response = match sender.try_send_request(outbound).await {
            Ok(response) => response,
            Err(mut err) => match err.take_message() {
                // The origin closed an idle connection before anything was written.
                Some(unsent) if reused => {
                    debug!(upstream = %self.addr, "pooled connection went away, reconnecting");
                    sender = self.connect().await?;
                    sender.ready().await.map_err(UpstreamError::Handshake)?;
                    sender
                        .send_request(unsent)
                        .await
                        .map_err(UpstreamError::Request)?
                }
                _ => return Err(UpstreamError::Request(err.into_error())),
            },
        };

        let (parts, incoming) = response.into_parts();
        let body = Limited::new(incoming, self.max_response_bytes)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    UpstreamError::TooLarge {
                        limit: self.max_response_bytes,
                    }
                } else {
                    UpstreamError::ResponseBody(e)
                }
            })?
            .to_bytes();
        self.checkin(sender);

        let code = parts.status.as_u16();
        let status = StatusCode::from_u16(code).ok_or(UpstreamError::InvalidStatus(code))?;
        let minor = if parts.version == http::Version::HTTP_10 { 0 } else { 1 };
        let mut response = Response::new(status).with_version(minor);
        if let Some(reason) = parts.extensions.get::<hyper::ext::ReasonPhrase>() {
            response = response.with_reason(String::from_utf8_lossy(reason.as_bytes()));
        }
        for (name, value) in &parts.headers {
            response.add_header(name.as_str(), value.as_bytes());
        }

        let headers = response.headers_mut();
        headers.remove("transfer-encoding");
        if method != Method::Head && !status.forbids_body() {
            let length = body.len().to_string();
            if headers.get("content-length") != Some(length.as_str()) {
                headers.set("Content-Length", length);
            }
        }
        response.set_payload(body);

        debug!(upstream = %self.addr, status = %status, "upstream responded");
        Ok(response)
    }

    /// Builds the outbound request. Framing headers are dropped; hyper
    /// derives `Content-Length` from the buffered body.
    fn outbound(&self, request: &Request, body: Bytes) -> Result<http::Request<Full<Bytes>>, UpstreamError> {
        let mut builder = http::Request::builder()
            .method(request.method().as_str())
            .uri(request.target());
        for (name, value) in request.headers().iter() {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !request.headers().contains("host") {
            builder = builder.header("host", self.authority.as_str());
        }
        Ok(builder.body(Full::new(body))?)
    }

    /// Takes a ready idle connection, or opens a new one. The flag is `true`
    /// for a reused connection.
    async fn checkout(&self) -> Result<(Sender, bool), UpstreamError> {
        loop {
            let idle = self.idle.lock().pop();
            let Some(mut sender) = idle else { break };
            if sender.ready().await.is_ok() {
                return Ok((sender, true));
            }
        }

        let mut sender = self.connect().await?;
        sender.ready().await.map_err(UpstreamError::Handshake)?;
        Ok((sender, false))
    }

    fn checkin(&self, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < Self::MAX_IDLE_CONNECTIONS {
            idle.push(sender);
        }
    }

    async fn connect(&self) -> Result<Sender, UpstreamError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(|source| UpstreamError::TlsHandshake {
                        addr: self.addr.clone(),
                        source,
                    })?;
                handshake(stream).await
            }
            None => handshake(stream).await,
        }
    }
}

/// Runs the HTTP/1.1 handshake and spawns the connection driver.
async fn handshake<S>(stream: S) -> Result<Sender, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(UpstreamError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "upstream connection closed with error");
        }
    });
    Ok(sender)
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("addr", &self.addr)
            .field("tls", &self.is_tls())
            .field("timeout", &self.timeout)
            .field("max_response_bytes", &self.max_response_bytes)
            .finish_non_exhaustive()
    }
}

impl RoundTrip for HttpTransport {
    fn round_trip(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(async move { Ok(self.send(request).await?) })
    }
}
